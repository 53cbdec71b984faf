//! Payload codecs and the static capability registry.
//!
//! The distributor never understands payload bytes; it looks up a codec by
//! the envelope's slot tag. Codecs are produced by name from a
//! [`CodecRegistry`] populated at configuration time — a static replacement
//! for loading reader/writer classes out of shared libraries at runtime.
//! Each connection gets its own [`SlotCodecs`] binding built from the
//! reader/writer descriptors of the sub-pipeline it ships.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::pipeline::PipelineSpec;
use crate::{Envelope, RouterError};

/// Encoder/decoder for one payload type.
///
/// Implementations must be object-safe and thread-safe; a single codec
/// instance may serve a connection's writer task and receive loop
/// concurrently.
pub trait PayloadCodec: Send + Sync {
    /// Encode an envelope's payload into wire bytes.
    ///
    /// # Errors
    ///
    /// [`RouterError::Codec`] if the payload cannot be encoded.
    fn encode(&self, unit: &Envelope) -> Result<Bytes, RouterError>;

    /// Decode wire bytes back into an envelope carrying the given slot.
    ///
    /// # Errors
    ///
    /// [`RouterError::Codec`] if the bytes are not a valid payload.
    fn decode(&self, slot: u16, body: Bytes) -> Result<Envelope, RouterError>;
}

/// Identity codec: payload bytes pass through unchanged.
///
/// Registered under the name `"raw"` in every new registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl PayloadCodec for RawCodec {
    fn encode(&self, unit: &Envelope) -> Result<Bytes, RouterError> {
        Ok(unit.payload.clone())
    }

    fn decode(&self, slot: u16, body: Bytes) -> Result<Envelope, RouterError> {
        Ok(Envelope { slot, payload: body })
    }
}

/// Factory producing codec instances on demand.
pub type CodecFactory = Arc<dyn Fn() -> Arc<dyn PayloadCodec> + Send + Sync>;

/// Name-indexed codec factories.
///
/// Populated once at configuration time; connections draw per-slot codec
/// instances from it when they are created.
#[derive(Clone)]
pub struct CodecRegistry {
    factories: HashMap<String, CodecFactory>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("CodecRegistry").field("names", &names).finish()
    }
}

impl CodecRegistry {
    /// Create a registry with the built-in `"raw"` codec registered.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("raw", Arc::new(|| Arc::new(RawCodec)));
        registry
    }

    /// Register a codec factory under a name, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, factory: CodecFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Instantiate the codec registered under `name`.
    ///
    /// # Errors
    ///
    /// [`RouterError::Codec`] if no factory is registered under `name`.
    pub fn build(&self, name: &str) -> Result<Arc<dyn PayloadCodec>, RouterError> {
        self.factories
            .get(name)
            .map(|f| f())
            .ok_or_else(|| RouterError::Codec(format!("no codec registered under '{name}'")))
    }

    /// Whether a codec is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection slot-to-codec bindings.
///
/// Readers decode inbound frames on the receive loop; writers encode
/// outbound envelopes on the writer task. Slots without a binding fall back
/// to raw pass-through.
#[derive(Clone, Default)]
pub struct SlotCodecs {
    readers: HashMap<u16, Arc<dyn PayloadCodec>>,
    writers: HashMap<u16, Arc<dyn PayloadCodec>>,
}

impl std::fmt::Debug for SlotCodecs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotCodecs")
            .field("readers", &self.readers.keys().collect::<Vec<_>>())
            .field("writers", &self.writers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SlotCodecs {
    /// Build bindings from every reader/writer descriptor in a pipeline
    /// specification, instantiating each named codec from the registry.
    ///
    /// # Errors
    ///
    /// [`RouterError::Codec`] if any named codec is not registered.
    pub fn from_spec(spec: &PipelineSpec, registry: &CodecRegistry) -> Result<Self, RouterError> {
        let mut bindings = Self::default();
        for stage in &spec.stages {
            for reader in &stage.readers {
                bindings.bind_reader(reader.slot, registry.build(&reader.codec)?);
            }
            for writer in &stage.writers {
                bindings.bind_writer(writer.slot, registry.build(&writer.codec)?);
            }
        }
        Ok(bindings)
    }

    /// Bind a decode codec to an inbound slot.
    pub fn bind_reader(&mut self, slot: u16, codec: Arc<dyn PayloadCodec>) {
        self.readers.insert(slot, codec);
    }

    /// Bind an encode codec to an outbound slot.
    pub fn bind_writer(&mut self, slot: u16, codec: Arc<dyn PayloadCodec>) {
        self.writers.insert(slot, codec);
    }

    /// Decode codec bound to `slot`, if any.
    pub fn reader(&self, slot: u16) -> Option<&Arc<dyn PayloadCodec>> {
        self.readers.get(&slot)
    }

    /// Encode codec bound to `slot`, if any.
    pub fn writer(&self, slot: u16) -> Option<&Arc<dyn PayloadCodec>> {
        self.writers.get(&slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{SlotBinding, StageDescriptor};

    #[test]
    fn test_raw_codec_round_trip() {
        let codec = RawCodec;
        let unit = Envelope::new(1000, &b"bytes"[..]);
        let encoded = codec.encode(&unit).expect("encode");
        let decoded = codec.decode(1000, encoded).expect("decode");
        assert_eq!(decoded, unit);
    }

    #[test]
    fn test_registry_has_raw_by_default() {
        let registry = CodecRegistry::new();
        assert!(registry.contains("raw"));
        assert!(registry.build("raw").is_ok());
    }

    #[test]
    fn test_registry_unknown_name_is_error() {
        let registry = CodecRegistry::new();
        let err = registry.build("imaging");
        assert!(matches!(err, Err(RouterError::Codec(_))));
    }

    #[test]
    fn test_registry_register_and_build() {
        let mut registry = CodecRegistry::new();
        registry.register("identity", Arc::new(|| Arc::new(RawCodec)));
        assert!(registry.contains("identity"));
        assert!(registry.build("identity").is_ok());
    }

    #[test]
    fn test_slot_codecs_from_spec_binds_all_slots() {
        let spec = PipelineSpec {
            stages: vec![StageDescriptor {
                name: "Worker".to_string(),
                library: String::new(),
                class_name: "Worker".to_string(),
                readers: vec![SlotBinding {
                    slot: 1000,
                    codec: "raw".to_string(),
                }],
                writers: vec![SlotBinding {
                    slot: 1001,
                    codec: "raw".to_string(),
                }],
            }],
        };

        let registry = CodecRegistry::new();
        let codecs = SlotCodecs::from_spec(&spec, &registry).expect("bindings");
        assert!(codecs.reader(1000).is_some());
        assert!(codecs.writer(1001).is_some());
        assert!(codecs.reader(1001).is_none());
    }

    #[test]
    fn test_slot_codecs_from_spec_unknown_codec_fails() {
        let spec = PipelineSpec {
            stages: vec![StageDescriptor {
                name: "Worker".to_string(),
                library: String::new(),
                class_name: "Worker".to_string(),
                readers: vec![SlotBinding {
                    slot: 1000,
                    codec: "missing".to_string(),
                }],
                writers: vec![],
            }],
        };

        let registry = CodecRegistry::new();
        let err = SlotCodecs::from_spec(&spec, &registry);
        assert!(matches!(err, Err(RouterError::Codec(_))));
    }
}
