//! Text-map carrier over gRPC metadata
//!
//! Lets an OpenTelemetry propagator read and write trace headers
//! (`traceparent`, `tracestate`, ...) without knowing about `MetadataMap`.

use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::{global, Context};
use std::borrow::{Borrow, BorrowMut};
use tonic::metadata::{KeyRef, MetadataKey, MetadataMap, MetadataValue};

/// Carrier adapter over a borrowed or owned [`MetadataMap`]
///
/// Read access ([`Extractor`]) works over `&MetadataMap`; write access
/// ([`Injector`]) needs `&mut MetadataMap` or an owned map.
pub struct MetadataCarrier<M> {
    metadata: M,
}

impl<M> MetadataCarrier<M> {
    pub fn new(metadata: M) -> Self {
        Self { metadata }
    }

    pub fn into_inner(self) -> M {
        self.metadata
    }
}

impl<M: Borrow<MetadataMap>> Extractor for MetadataCarrier<M> {
    /// First value for `key`; missing, empty and non-ASCII values read as absent
    fn get(&self, key: &str) -> Option<&str> {
        self.metadata
            .borrow()
            .get(key)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    }

    fn keys(&self) -> Vec<&str> {
        self.metadata
            .borrow()
            .keys()
            .filter_map(|key| match key {
                KeyRef::Ascii(k) => Some(k.as_str()),
                KeyRef::Binary(_) => None,
            })
            .collect()
    }
}

impl<M: BorrowMut<MetadataMap>> Injector for MetadataCarrier<M> {
    /// Replace any existing value for `key`
    fn set(&mut self, key: &str, value: String) {
        let name = match MetadataKey::from_bytes(key.as_bytes()) {
            Ok(name) => name,
            Err(e) => {
                tracing::debug!(
                    key,
                    "Failed to create metadata key for trace injection: {:?}",
                    e
                );
                return;
            }
        };
        let val = match MetadataValue::try_from(&value) {
            Ok(val) => val,
            Err(e) => {
                tracing::debug!(
                    key,
                    "Failed to create metadata value for trace injection: {:?}",
                    e
                );
                return;
            }
        };
        self.metadata.borrow_mut().insert(name, val);
    }
}

/// Extract the remote trace context from incoming metadata using the global propagator
pub fn extract_context(metadata: &MetadataMap) -> Context {
    global::get_text_map_propagator(|propagator| {
        propagator.extract(&MetadataCarrier::new(metadata))
    })
}

/// Inject `cx` into outgoing metadata using the global propagator
pub fn inject_context(cx: &Context, metadata: &mut MetadataMap) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut MetadataCarrier::new(&mut *metadata))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::BinaryMetadataValue;

    fn metadata(entries: &[(&'static str, &'static str)]) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        for (key, value) in entries {
            metadata.insert(*key, MetadataValue::from_static(*value));
        }
        metadata
    }

    #[test]
    fn test_carrier_get() {
        let md = metadata(&[
            ("x-test-key", "test-value"),
            ("x-another", "another-value"),
            ("x-empty-key", ""),
        ]);
        let carrier = MetadataCarrier::new(&md);

        assert_eq!(carrier.get("x-test-key"), Some("test-value"));
        assert_eq!(carrier.get("x-another"), Some("another-value"));
        assert_eq!(carrier.get("x-not-exist"), None);
        assert_eq!(carrier.get("x-empty-key"), None);
    }

    #[test]
    fn test_carrier_set_then_get() {
        let mut md = MetadataMap::new();
        let mut carrier = MetadataCarrier::new(&mut md);

        carrier.set("x-new-key", "new-value".to_string());
        assert_eq!(carrier.get("x-new-key"), Some("new-value"));

        carrier.set("x-new-key", "replaced".to_string());
        assert_eq!(carrier.get("x-new-key"), Some("replaced"));

        drop(carrier);
        assert_eq!(md.get_all("x-new-key").iter().count(), 1);
    }

    #[test]
    fn test_carrier_set_uppercase_key_is_normalized() {
        let mut carrier = MetadataCarrier::new(MetadataMap::new());
        carrier.set("X-Upper", "value".to_string());

        let md = carrier.into_inner();
        assert_eq!(md.get("x-upper").unwrap().to_str().unwrap(), "value");
    }

    #[test]
    fn test_carrier_set_skips_invalid_value() {
        let mut carrier = MetadataCarrier::new(MetadataMap::new());
        carrier.set("x-bad", "line\nbreak".to_string());

        assert!(carrier.get("x-bad").is_none());
    }

    #[test]
    fn test_carrier_keys() {
        let mut md = metadata(&[("key1", "value1"), ("key2", "value2"), ("key3", "value3")]);
        md.insert_bin("trace-bin", BinaryMetadataValue::from_bytes(b"\x01\x02"));

        let carrier = MetadataCarrier::new(&md);
        let mut keys = carrier.keys();
        keys.sort_unstable();

        assert_eq!(keys, vec!["key1", "key2", "key3"]);
    }
}
