//! The contract between the HTTP adapter and the execution sandbox.
//!
//! The adapter never looks inside the sandbox. It hands over one
//! [`InitDescriptor`] before the first invoke, then one [`InvocationRequest`]
//! per HTTP request, and translates the returned [`SandboxError`] into an
//! HTTP answer.

use crate::config::Credentials;
use crate::environment::EnvironmentSnapshot;
use crate::error::InitError;
use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Bootstrap locations probed when no command is given, in order.
pub const DEFAULT_BOOTSTRAP_PATHS: [&str; 3] =
    ["/var/runtime/bootstrap", "/var/task/bootstrap", "/opt/bootstrap"];

/// An execution sandbox that can be initialised once and invoked repeatedly.
///
/// Implementations own isolation, process lifecycle and the reservation
/// protocol (reserve, invoke, await release). At most one reservation is
/// active at a time; contention is reported through [`SandboxError`].
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Bootstraps the function. Called exactly once per emulator process.
    async fn init(&self, descriptor: InitDescriptor, invoke_timeout_ms: u64)
    -> Result<(), InitError>;

    /// Runs a single invocation, writing the function's reply into `response`.
    async fn invoke(
        &self,
        response: &mut ResponseBuffer,
        request: InvocationRequest,
    ) -> Result<(), SandboxError>;
}

/// The closed set of outcomes a sandbox reports for a failed invoke.
///
/// Variants are grouped by the reservation phase that produced them.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxError {
    // Reserve phase.
    /// Another invocation holds the reservation.
    #[error("sandbox already reserved")]
    AlreadyReserved,
    /// The sandbox failed internally.
    #[error("internal server error")]
    InternalServerError,
    /// Initialisation finished with a failure.
    #[error("init failed")]
    InitDoneFailed,
    /// The reservation was superseded while reserving.
    #[error("reservation done while reserving")]
    ReserveReservationDone,

    // Invoke phase.
    /// No reservation is held.
    #[error("not reserved")]
    NotReserved,
    /// The invocation was already replied to.
    #[error("already replied")]
    AlreadyReplied,
    /// An invocation is already in progress.
    #[error("already invoking")]
    AlreadyInvocating,
    /// The reservation was superseded while invoking.
    #[error("reservation done while invoking")]
    InvokeReservationDone,
    /// The invoke response was already written to the sink.
    #[error("invoke response already written")]
    InvokeResponseAlreadyWritten,

    // Await-release phase.
    /// The invocation finished with a failure.
    #[error("invoke failed")]
    InvokeDoneFailed,
    /// The reservation was superseded while awaiting release.
    #[error("reservation done while releasing")]
    ReleaseReservationDone,
    /// The function ran past its timeout.
    #[error("invoke timed out")]
    InvokeTimeout,
}

impl SandboxError {
    /// Every outcome kind, in declaration order.
    pub const ALL: [SandboxError; 12] = [
        SandboxError::AlreadyReserved,
        SandboxError::InternalServerError,
        SandboxError::InitDoneFailed,
        SandboxError::ReserveReservationDone,
        SandboxError::NotReserved,
        SandboxError::AlreadyReplied,
        SandboxError::AlreadyInvocating,
        SandboxError::InvokeReservationDone,
        SandboxError::InvokeResponseAlreadyWritten,
        SandboxError::InvokeDoneFailed,
        SandboxError::ReleaseReservationDone,
        SandboxError::InvokeTimeout,
    ];
}

/// Sandbox flavour tag carried in the init descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxType {
    /// On-demand sandbox, initialised by the first invoke.
    #[default]
    Classic,
}

/// Runtime metadata reported to the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    /// Image configuration document.
    pub image_json: String,
    /// Runtime version ARN.
    pub arn: String,
    /// Runtime version.
    pub version: String,
}

impl Default for RuntimeInfo {
    fn default() -> Self {
        Self {
            image_json: "{}".to_string(),
            arn: String::new(),
            version: String::new(),
        }
    }
}

/// The command the sandbox runs as the function runtime.
///
/// An empty bootstrap means the runtime is started by someone else and will
/// connect to the sandbox on its own.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bootstrap {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl Bootstrap {
    /// Creates a bootstrap from a command line.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            working_dir: None,
        }
    }

    /// A bootstrap for an externally managed runtime.
    pub fn external() -> Self {
        Self::default()
    }

    /// Picks the first of [`DEFAULT_BOOTSTRAP_PATHS`] that exists, or the first
    /// one when none do so the failure surfaces at init.
    pub fn discover() -> Self {
        let path = DEFAULT_BOOTSTRAP_PATHS
            .iter()
            .find(|p| Path::new(p).exists())
            .unwrap_or(&DEFAULT_BOOTSTRAP_PATHS[0]);
        Self::new([*path])
    }

    /// Sets the working directory for the runtime.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// The command line; empty for an external runtime.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// The working directory, if set.
    pub fn cwd(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Whether the runtime is managed outside the sandbox.
    pub fn is_external(&self) -> bool {
        self.command.is_empty()
    }
}

/// One-time bootstrap input for the sandbox.
#[derive(Debug, Clone)]
pub struct InitDescriptor {
    /// Handler reference.
    pub handler: String,
    /// Credentials for the function.
    pub credentials: Credentials,
    /// X-Ray daemon address.
    pub xray_daemon_address: String,
    /// Function name.
    pub function_name: String,
    /// Function version.
    pub function_version: String,
    /// Runtime metadata.
    pub runtime_info: RuntimeInfo,
    /// Variables the function can see.
    pub environment: EnvironmentSnapshot,
    /// Sandbox flavour.
    pub sandbox_type: SandboxType,
    /// Runtime command.
    pub bootstrap: Bootstrap,
}

/// A single invoke handed to the sandbox.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// Globally unique request id.
    pub id: String,
    /// ARN the caller invoked.
    pub invoked_function_arn: String,
    /// Value of the inbound `X-Amzn-Trace-Id` header.
    pub trace_id: String,
    /// Value of the inbound `X-Amzn-Segment-Id` header.
    pub lambda_segment_id: String,
    /// Event payload.
    pub payload: Bytes,
}

/// Deferred HTTP response the sandbox writes into.
///
/// Nothing reaches the client until the dispatcher decides how the outcome
/// maps to HTTP, so failure paths can replace or drop what the function wrote.
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    status: Option<StatusCode>,
    body: BytesMut,
}

impl ResponseBuffer {
    /// Creates an empty buffer with no status set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status code. The last call wins.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// Appends bytes to the body.
    pub fn write(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    /// The explicitly set status, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// The body written so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Splits into status and frozen body.
    pub fn into_parts(self) -> (Option<StatusCode>, Bytes) {
        (self.status, self.body.freeze())
    }
}
