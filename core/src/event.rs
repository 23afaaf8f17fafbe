//! Controller events.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A message published through the backend's event bus and fanned out to
/// every subscribed host. `groups = None` means "all groups".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Shutdown { groups: Option<HashSet<String>> },
    Pause { groups: Option<HashSet<String>> },
    Resume { groups: Option<HashSet<String>> },
}

impl Event {
    pub fn shutdown_all() -> Self {
        Event::Shutdown { groups: None }
    }

    pub fn pause_all() -> Self {
        Event::Pause { groups: None }
    }

    pub fn resume_all() -> Self {
        Event::Resume { groups: None }
    }

    /// Whether this event applies to `group`, per the `None` = "all groups"
    /// convention.
    pub fn applies_to(groups: &Option<HashSet<String>>, group: &str) -> bool {
        match groups {
            None => true,
            Some(set) => set.contains(group),
        }
    }
}
