//! The Controller: a thin wrapper over the backend's event bus.

use std::sync::Arc;

use crate::backend::{Backend, EventSubscription};
use crate::error::BackendError;
use crate::event::Event;

/// Publishes and subscribes to control events. Every process host wraps its
/// backend handle in one of these and routes delivered events to its
/// scheduler and worker pools; it carries no state of its own beyond the
/// backend reference.
pub struct Controller {
    backend: Arc<dyn Backend>,
}

impl Controller {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Controller { backend }
    }

    pub async fn send_event(&self, event: Event) -> Result<(), BackendError> {
        self.backend.publish_event(event).await
    }

    pub async fn subscribe(&self) -> Result<Box<dyn EventSubscription>, BackendError> {
        self.backend.subscribe_events().await
    }

    pub async fn shutdown(&self, groups: Option<std::collections::HashSet<String>>) -> Result<(), BackendError> {
        self.send_event(Event::Shutdown { groups }).await
    }

    pub async fn pause(&self, groups: Option<std::collections::HashSet<String>>) -> Result<(), BackendError> {
        self.send_event(Event::Pause { groups }).await
    }

    pub async fn resume(&self, groups: Option<std::collections::HashSet<String>>) -> Result<(), BackendError> {
        self.send_event(Event::Resume { groups }).await
    }
}
