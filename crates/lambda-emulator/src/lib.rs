//! # Lambda Invoke Emulator
//!
//! A local HTTP front end for AWS Lambda functions. It accepts invocations the
//! way the Lambda Invoke API does, hands them to a pluggable [`Sandbox`], and
//! answers with the function's response, a timeout message, or an error status.
//!
//! ## Overview
//!
//! Two styles of request are accepted:
//!
//! - `POST /2015-03-31/functions/function/invocations` - the request body is
//!   the event payload, unchanged
//! - `POST /` and `POST /{*path}` - the request is treated like a function URL
//!   call and converted into an [`EventEnvelope`] first
//!
//! The first invocation initialises the sandbox exactly once. Every invocation
//! prints `START`, `END` and `REPORT` lines in the platform's log format.
//!
//! ## Quick Start
//!
//! ```no_run
//! use lambda_emulator::{Bootstrap, Emulator, RuntimeApiSandbox};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sandbox = RuntimeApiSandbox::start(([127, 0, 0, 1], 9001).into()).await?;
//!
//!     let emulator = Emulator::builder()
//!         .sandbox(Arc::new(sandbox))
//!         .bootstrap(Bootstrap::new(["/var/task/bootstrap"]))
//!         .port(8080)
//!         .build()
//!         .await?;
//!
//!     println!("Invoke at {}", emulator.invocations_url());
//!     emulator.wait().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Function settings come from the environment captured at startup. See
//! [`config`] for the variables and their defaults.
//!
//! ## Outcome Mapping
//!
//! Sandbox outcomes form the closed [`SandboxError`] set. The mapping to HTTP
//! is documented in [`dispatch`].

pub mod config;
pub mod dispatch;
pub mod environment;
pub mod error;
pub mod event;
pub mod init_gate;
pub mod report;
pub mod runtime;
pub mod sandbox;
pub mod server;

pub use config::{ConfigBuilder, Credentials, EmulatorConfig};
pub use dispatch::{Disposition, Dispatcher};
pub use environment::EnvironmentSnapshot;
pub use error::{
    ConfigError, EmulatorError, EmulatorResult, InitError, RuntimeApiError, TranslateError,
};
pub use event::EventEnvelope;
pub use init_gate::{InitGate, InitOutcome};
pub use report::{CapturedLines, TelemetryReporter};
pub use runtime::RuntimeApiSandbox;
pub use sandbox::{
    Bootstrap, InitDescriptor, InvocationRequest, ResponseBuffer, RuntimeInfo, Sandbox,
    SandboxError, SandboxType,
};
pub use server::{Emulator, EmulatorBuilder, INVOCATIONS_PATH};
