//! One-shot sandbox initialisation.
//!
//! The gate lives in the server state. The first invocation runs the sandbox
//! init; invocations that arrive while it is in flight wait on the same cell
//! and never trigger a second init.

use crate::config::EmulatorConfig;
use crate::environment::EnvironmentSnapshot;
use crate::report::clamp_millis;
use crate::sandbox::{Bootstrap, InitDescriptor, RuntimeInfo, Sandbox, SandboxType};
use std::time::Instant;
use tokio::sync::OnceCell;

/// Address advertised for the X-Ray daemon. Nothing listens there.
const XRAY_DAEMON_ADDRESS: &str = "0.0.0.0:0";

/// Result of the single init call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitOutcome {
    /// Init wall-clock time in milliseconds, clamped to the function timeout.
    pub duration_ms: f64,
    /// Whether the sandbox reported success.
    pub succeeded: bool,
}

/// Guards the single call to [`Sandbox::init`].
#[derive(Debug, Default)]
pub struct InitGate {
    cell: OnceCell<InitOutcome>,
}

impl InitGate {
    /// Creates a gate that has not fired yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether init has completed.
    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    /// Runs sandbox init if nobody has yet.
    ///
    /// Returns the init outcome to the caller whose request performed init,
    /// and `None` to everyone else, so only the cold-start request reports an
    /// init duration.
    pub async fn ensure_initialized(
        &self,
        sandbox: &dyn Sandbox,
        config: &EmulatorConfig,
        environment: &EnvironmentSnapshot,
        bootstrap: &Bootstrap,
    ) -> Option<InitOutcome> {
        let mut performed = false;

        let outcome = *self
            .cell
            .get_or_init(|| async {
                performed = true;
                run_init(sandbox, config, environment, bootstrap).await
            })
            .await;

        performed.then_some(outcome)
    }
}

/// Builds the descriptor handed to the sandbox.
pub fn build_descriptor(
    config: &EmulatorConfig,
    environment: &EnvironmentSnapshot,
    bootstrap: &Bootstrap,
) -> InitDescriptor {
    InitDescriptor {
        handler: config.handler.clone().unwrap_or_default(),
        credentials: config.credentials.clone(),
        xray_daemon_address: XRAY_DAEMON_ADDRESS.to_string(),
        function_name: config.function_name.clone(),
        function_version: config.function_version.clone(),
        runtime_info: RuntimeInfo::default(),
        environment: environment.clone(),
        sandbox_type: SandboxType::Classic,
        bootstrap: bootstrap.clone(),
    }
}

async fn run_init(
    sandbox: &dyn Sandbox,
    config: &EmulatorConfig,
    environment: &EnvironmentSnapshot,
    bootstrap: &Bootstrap,
) -> InitOutcome {
    let descriptor = build_descriptor(config, environment, bootstrap);

    tracing::debug!(
        function_name = %descriptor.function_name,
        function_version = %descriptor.function_version,
        "Initialising sandbox"
    );

    let init_start = Instant::now();
    let result = sandbox.init(descriptor, config.timeout_ms()).await;
    let duration_ms = clamp_millis(init_start.elapsed(), config.function_timeout);

    let succeeded = match result {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("Sandbox init failed: {}", e);
            false
        }
    };

    InitOutcome {
        duration_ms,
        succeeded,
    }
}
