//! Reference encoder.
//!
//! `Encoder` is deliberately not a registry-wide trait: a trait with generic
//! `encode<T>`/`decode<T>` methods isn't object-safe, and the handler
//! registry needs to store handlers of different concrete data types behind
//! one `Arc<dyn TaskHandler>`. Instead each `TaskHandler` impl owns its own
//! decode/run/encode sequence and reaches for a concrete helper like
//! `JsonEncoder` internally, which is exactly what it is: a helper, not a
//! trait object.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::TaskFailure;

/// A `serde_json`-backed encode/decode helper. Round-trips any
/// `Serialize + DeserializeOwned` value losslessly.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEncoder;

impl JsonEncoder {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, TaskFailure> {
        serde_json::to_vec(value).map_err(|e| TaskFailure::Encode(e.to_string()))
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, TaskFailure> {
        serde_json::from_slice(bytes).map_err(|e| TaskFailure::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn round_trips_derived_types() {
        let encoder = JsonEncoder;
        let original = Point { x: 3, y: -4 };
        let bytes = encoder.encode(&original).unwrap();
        let decoded: Point = encoder.decode(&bytes).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn decode_failure_surfaces_as_decode_error() {
        let encoder = JsonEncoder;
        let err = encoder.decode::<Point>(b"not json").unwrap_err();
        assert!(matches!(err, TaskFailure::Decode(_)));
    }
}
