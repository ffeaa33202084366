//! Per-key serialization contract.

use crate::error::{CacheError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Encodes values to the string form kept in the synchronous store.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<String>;
    fn decode(&self, raw: &str) -> Result<T>;
}

/// JSON codec, the default for every binding.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        JsonCodec(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec<T> {
    fn encode(&self, value: &T) -> Result<String> {
        serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(&self, raw: &str) -> Result<T> {
        serde_json::from_str(raw).map_err(|e| CacheError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Settings {
        theme: String,
        widgets: Vec<String>,
        limits: BTreeMap<String, u32>,
    }

    #[test]
    fn test_json_preserves_shape() {
        let codec = JsonCodec::<Settings>::new();
        let value = Settings {
            theme: "dark".into(),
            widgets: vec!["sales".into(), "goals".into()],
            limits: BTreeMap::from([("daily".to_string(), 3)]),
        };
        let raw = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&raw).unwrap(), value);
    }

    #[test]
    fn test_decode_garbage() {
        let codec = JsonCodec::<Vec<u32>>::new();
        let err = codec.decode("{not json").unwrap_err();
        assert!(matches!(err, CacheError::Deserialization(_)));
    }

    #[test]
    fn test_encode_failure_is_serialization_error() {
        // Maps with non-string keys cannot be written as JSON objects.
        let codec = JsonCodec::<BTreeMap<Vec<u8>, u32>>::new();
        let value = BTreeMap::from([(vec![1u8], 1u32)]);
        let err = codec.encode(&value).unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }
}
