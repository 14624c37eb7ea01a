use std::sync::Arc;

use queuert_core::{async_trait, ContinuationProposal, Engine, JobTypeValidationError, Registry};
use queuert_postgres::{PgNotifyAdapter, PgStateAdapter};
use sqlx::PgPool;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// A registry that accepts everything, mirroring `queuert-core`'s own test harness
/// (`tests/common/mod.rs`); these integration tests exercise the Postgres adapter,
/// not schema validation.
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

pub type TestEngine = Engine<PgStateAdapter, PgNotifyAdapter, PermissiveRegistry>;

/// A fresh Postgres container, migrated, with an `Engine` wired up against it.
/// Each test gets its own container (no state to collide on) at the cost of a
/// slower per-test startup - acceptable for the small suite here.
#[allow(dead_code)]
pub struct PgHarness {
    pub engine: TestEngine,
    pub pool: PgPool,
    _container: ContainerAsync<GenericImage>,
}

impl PgHarness {
    pub async fn start() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let container = GenericImage::new("postgres", "16-alpine")
            .with_wait_for(WaitFor::message_on_stderr(
                "database system is ready to accept connections",
            ))
            .with_exposed_port(ContainerPort::Tcp(5432))
            .with_env_var("POSTGRES_PASSWORD", "queuert")
            .with_env_var("POSTGRES_USER", "queuert")
            .with_env_var("POSTGRES_DB", "queuert")
            .start()
            .await
            .expect("failed to start postgres container");

        let host = container.get_host().await.expect("container host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("container port");
        let url = format!("postgresql://queuert:queuert@{host}:{port}/queuert");

        let pool = PgPool::connect(&url)
            .await
            .expect("failed to connect to test postgres");

        let state = PgStateAdapter::new(pool.clone());
        state.migrate().await.expect("failed to run migrations");

        let notify = PgNotifyAdapter::new(pool.clone());
        let engine = Engine::new(Arc::new(state), Arc::new(notify), Arc::new(PermissiveRegistry));

        Self {
            engine,
            pool,
            _container: container,
        }
    }
}
