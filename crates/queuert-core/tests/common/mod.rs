use std::sync::Arc;

use queuert_core::{
    async_trait, ContinuationProposal, Engine, JobTypeValidationError, Registry,
};
use queuert_testing::{MemoryNotifyAdapter, MemoryStateAdapter};

/// A registry that accepts everything. The suite under `tests/` exercises the
/// engine and worker loop, not schema validation, so no job type is ever rejected.
pub struct PermissiveRegistry;

#[async_trait]
impl Registry for PermissiveRegistry {
    async fn validate_entry(&self, _type_name: &str) -> Result<(), JobTypeValidationError> {
        Ok(())
    }

    async fn parse_input(
        &self,
        _type_name: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, JobTypeValidationError> {
        Ok(input)
    }

    async fn parse_output(
        &self,
        _type_name: &str,
        output: serde_json::Value,
    ) -> Result<serde_json::Value, JobTypeValidationError> {
        Ok(output)
    }

    async fn validate_continue_with(
        &self,
        _from_type_name: &str,
        _proposal: &ContinuationProposal,
    ) -> Result<(), JobTypeValidationError> {
        Ok(())
    }

    async fn validate_blockers(
        &self,
        _type_name: &str,
        _blockers: &[ContinuationProposal],
    ) -> Result<(), JobTypeValidationError> {
        Ok(())
    }
}

pub type TestEngine = Engine<MemoryStateAdapter, MemoryNotifyAdapter, PermissiveRegistry>;

pub fn test_engine() -> TestEngine {
    Engine::new(
        Arc::new(MemoryStateAdapter::new()),
        Arc::new(MemoryNotifyAdapter::new()),
        Arc::new(PermissiveRegistry),
    )
}
