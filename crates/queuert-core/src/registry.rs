//! The job type registry contract (`spec.md` §4.3).
//!
//! A user-provided implementation of runtime schema validation. The engine never
//! inspects `input`/`output` payloads itself; it only asks the registry whether a
//! value is acceptable, the same way `seesaw-core`'s `Effect`/`Command` traits leave
//! serialization to the implementor.

use async_trait::async_trait;

use crate::error::JobTypeValidationError;

/// A proposed continuation, as passed to [`Registry::validate_continue_with`].
#[derive(Debug, Clone)]
pub struct ContinuationProposal {
    pub type_name: String,
    pub input: serde_json::Value,
}

/// Five hooks the engine calls at the point an input, output, continuation or
/// blocker set is introduced. Any hook returning `Err` aborts that call; the engine
/// itself never retries a validation failure.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Is `type_name` a registered "entry" type (may start a chain)?
    async fn validate_entry(&self, type_name: &str) -> Result<(), JobTypeValidationError>;

    /// Parse/validate a job's input payload against its type's schema.
    async fn parse_input(
        &self,
        type_name: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, JobTypeValidationError>;

    /// Parse/validate a job's output payload against its type's schema.
    async fn parse_output(
        &self,
        type_name: &str,
        output: serde_json::Value,
    ) -> Result<serde_json::Value, JobTypeValidationError>;

    /// Validate that `from_type_name` is allowed to continue into `proposal.type_name`
    /// with the given input.
    async fn validate_continue_with(
        &self,
        from_type_name: &str,
        proposal: &ContinuationProposal,
    ) -> Result<(), JobTypeValidationError>;

    /// Validate a proposed set of blocker chain starters for `type_name`.
    async fn validate_blockers(
        &self,
        type_name: &str,
        blockers: &[ContinuationProposal],
    ) -> Result<(), JobTypeValidationError>;
}
