//! # Stage: Declarative Pipeline Specification
//!
//! ## Responsibility
//! Parse, validate, and serialize the ordered list of stage descriptors that
//! defines a pipeline, and slice out the contiguous sub-chain the
//! distributor ships to remote workers.
//!
//! ## Guarantees
//! - Deterministic: the same TOML input always produces the same spec
//! - Validated: semantic constraints are checked before a spec is accepted
//! - Type-safe: malformed fields are caught at parse time via serde
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Running stages (see: `stage`)
//! - Routing decisions (see: `router`, `policy`)
//! - Codec instantiation (see: `codec`)

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::wire::SLOT_DATA_MIN;
use crate::RouterError;

/// Binding of one wire slot to a named payload codec.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SlotBinding {
    /// Wire slot tag; must be ≥ 1000 (lower slots are control traffic).
    pub slot: u16,
    /// Name of the codec in the [`CodecRegistry`](crate::codec::CodecRegistry).
    pub codec: String,
}

/// One stage in the ordered pipeline description.
///
/// `library` and `class_name` identify the implementation the hosting
/// process should instantiate; the distributor itself treats them as opaque
/// identifiers and only matches on `name`.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct StageDescriptor {
    /// Unique stage name within the pipeline.
    pub name: String,
    /// Library reference the implementation lives in.
    #[serde(default)]
    pub library: String,
    /// Class identifier of the implementation.
    pub class_name: String,
    /// Inbound slot-to-codec bindings this stage requires.
    #[serde(default)]
    pub readers: Vec<SlotBinding>,
    /// Outbound slot-to-codec bindings this stage requires.
    #[serde(default)]
    pub writers: Vec<SlotBinding>,
}

/// Ordered sequence of stage descriptors defining a pipeline.
///
/// The same type describes both a full pipeline and the sub-chain produced
/// by [`PipelineSpec::sub_chain`], which is what a new connection ships to a
/// remote worker as its first handshake frame.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PipelineSpec {
    /// Stages, in processing order.
    #[serde(default)]
    pub stages: Vec<StageDescriptor>,
}

impl PipelineSpec {
    /// Parse a spec from its TOML wire form.
    ///
    /// # Errors
    ///
    /// [`RouterError::Config`] if the TOML is malformed.
    pub fn from_toml(input: &str) -> Result<Self, RouterError> {
        toml::from_str(input).map_err(|e| RouterError::Config(format!("invalid pipeline TOML: {e}")))
    }

    /// Serialize to the TOML wire form shipped during the handshake.
    ///
    /// # Errors
    ///
    /// [`RouterError::Config`] if serialization fails.
    pub fn to_toml(&self) -> Result<String, RouterError> {
        toml::to_string(self).map_err(|e| RouterError::Config(format!("pipeline TOML: {e}")))
    }

    /// Check semantic constraints: at least one stage, non-empty unique
    /// names, non-empty class identifiers, and no slot binding inside the
    /// reserved control range.
    ///
    /// # Errors
    ///
    /// [`RouterError::Config`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.stages.is_empty() {
            return Err(RouterError::Config("pipeline has no stages".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if stage.name.is_empty() {
                return Err(RouterError::Config("stage with empty name".to_string()));
            }
            if stage.class_name.is_empty() {
                return Err(RouterError::Config(format!(
                    "stage '{}' has empty class_name",
                    stage.name
                )));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(RouterError::Config(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            for binding in stage.readers.iter().chain(stage.writers.iter()) {
                if binding.slot < SLOT_DATA_MIN {
                    return Err(RouterError::Config(format!(
                        "stage '{}' binds reserved slot {}",
                        stage.name, binding.slot
                    )));
                }
            }
        }
        Ok(())
    }

    /// Position of the stage named `name`, if present.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Slice out the contiguous sub-chain strictly after the stage named
    /// `after`, up to and including the stage named `through`.
    ///
    /// This is what the distributor ships to a remote worker: everything
    /// downstream of itself through the collector, so the remote side can
    /// run an equivalent sub-pipeline.
    ///
    /// # Errors
    ///
    /// [`RouterError::CollectorNotFound`] if `through` is absent or does not
    /// come after `after`; [`RouterError::Config`] if `after` is absent.
    pub fn sub_chain(&self, after: &str, through: &str) -> Result<PipelineSpec, RouterError> {
        let start = self
            .position(after)
            .ok_or_else(|| RouterError::Config(format!("stage '{after}' not in pipeline")))?;
        let end = self
            .position(through)
            .filter(|&end| end > start)
            .ok_or_else(|| RouterError::CollectorNotFound(through.to_string()))?;

        Ok(PipelineSpec {
            stages: self.stages[start + 1..=end].to_vec(),
        })
    }
}

/// Export the JSON Schema for [`PipelineSpec`].
///
/// Enables IDE autocomplete when editing pipeline TOML files.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(PipelineSpec);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> StageDescriptor {
        StageDescriptor {
            name: name.to_string(),
            library: "core".to_string(),
            class_name: format!("{name}Impl"),
            readers: vec![],
            writers: vec![],
        }
    }

    fn five_stage_spec() -> PipelineSpec {
        PipelineSpec {
            stages: vec![
                descriptor("A"),
                descriptor("Router"),
                descriptor("C"),
                descriptor("Collector"),
                descriptor("D"),
            ],
        }
    }

    #[test]
    fn test_sub_chain_after_router_through_collector() {
        let spec = five_stage_spec();
        let slice = spec.sub_chain("Router", "Collector").expect("slice");
        let names: Vec<&str> = slice.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["C", "Collector"]);
    }

    #[test]
    fn test_sub_chain_excludes_surrounding_stages() {
        let spec = five_stage_spec();
        let slice = spec.sub_chain("Router", "Collector").expect("slice");
        for excluded in ["A", "Router", "D"] {
            assert!(slice.position(excluded).is_none(), "{excluded} leaked into slice");
        }
    }

    #[test]
    fn test_sub_chain_missing_collector_fails() {
        let spec = five_stage_spec();
        let err = spec.sub_chain("Router", "Missing");
        assert!(matches!(err, Err(RouterError::CollectorNotFound(_))));
    }

    #[test]
    fn test_sub_chain_collector_before_router_fails() {
        let spec = five_stage_spec();
        let err = spec.sub_chain("Collector", "Router");
        assert!(matches!(err, Err(RouterError::CollectorNotFound(_))));
    }

    #[test]
    fn test_sub_chain_missing_router_fails() {
        let spec = five_stage_spec();
        let err = spec.sub_chain("Ghost", "Collector");
        assert!(matches!(err, Err(RouterError::Config(_))));
    }

    #[test]
    fn test_toml_round_trip() {
        let spec = five_stage_spec();
        let toml = spec.to_toml().expect("serialize");
        let parsed = PipelineSpec::from_toml(&toml).expect("parse");
        assert_eq!(parsed, spec);
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        let err = PipelineSpec::from_toml("not [ valid toml");
        assert!(matches!(err, Err(RouterError::Config(_))));
    }

    #[test]
    fn test_validate_accepts_well_formed_spec() {
        assert!(five_stage_spec().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_pipeline() {
        let spec = PipelineSpec { stages: vec![] };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let spec = PipelineSpec {
            stages: vec![descriptor("A"), descriptor("A")],
        };
        let err = spec.validate();
        assert!(matches!(err, Err(RouterError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_class_name() {
        let mut spec = five_stage_spec();
        spec.stages[0].class_name.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_control_slot_binding() {
        let mut spec = five_stage_spec();
        spec.stages[2].readers.push(SlotBinding {
            slot: 4, // reserved: close sentinel
            codec: "raw".to_string(),
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_export_schema_produces_valid_json() {
        let schema = export_schema().expect("schema export");
        let parsed: serde_json::Value =
            serde_json::from_str(&schema).expect("schema is valid JSON");
        assert!(parsed.get("properties").is_some() || parsed.get("$ref").is_some());
    }

    #[test]
    fn test_descriptor_library_defaults_to_empty() {
        let parsed: StageDescriptor = toml::from_str(
            r#"
            name = "Worker"
            class_name = "WorkerImpl"
            "#,
        )
        .expect("parse descriptor");
        assert!(parsed.library.is_empty());
        assert!(parsed.readers.is_empty());
    }
}
