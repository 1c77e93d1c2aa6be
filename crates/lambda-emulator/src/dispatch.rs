//! Invocation dispatch and outcome mapping.
//!
//! Each HTTP invoke becomes one [`InvocationRequest`]. The sandbox writes into
//! a [`ResponseBuffer`] and reports an outcome, which is mapped to HTTP here:
//!
//! | Outcome | Status | Body |
//! |---------|--------|------|
//! | success | buffered (default 200) | buffered |
//! | `AlreadyReserved`, `NotReserved`, `AlreadyReplied`, `AlreadyInvocating` | 400 | empty |
//! | `InternalServerError` | 500 | empty |
//! | `InitDoneFailed`, `InvokeDoneFailed` | 502 | buffered diagnostics |
//! | `*ReservationDone` | 504 | empty |
//! | `InvokeResponseAlreadyWritten` | buffered | buffered |
//! | `InvokeTimeout` | 200 | `Task timed out after N.00 seconds` |

use crate::config::EmulatorConfig;
use crate::environment::EnvironmentSnapshot;
use crate::init_gate::InitGate;
use crate::report::TelemetryReporter;
use crate::sandbox::{Bootstrap, InvocationRequest, ResponseBuffer, Sandbox, SandboxError};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Trace header copied into the invocation.
pub const TRACE_ID_HEADER: &str = "X-Amzn-Trace-Id";
/// Segment header copied into the invocation.
pub const SEGMENT_ID_HEADER: &str = "X-Amzn-Segment-Id";

/// Delay after a timeout before answering, approximating platform propagation.
pub const TIMEOUT_PAUSE: Duration = Duration::from_millis(100);

/// What the dispatcher does with an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Send the buffered response, emitting END/REPORT first when `report` is set.
    Commit {
        /// Whether END/REPORT lines are emitted.
        report: bool,
    },
    /// Send `status` with an empty body.
    Empty(StatusCode),
    /// Send `status` with the diagnostics the sandbox buffered.
    Diagnostic(StatusCode),
    /// Report, send the timeout message, then pause.
    TimedOut,
}

impl Disposition {
    /// Maps an invoke outcome. The match is exhaustive over [`SandboxError`].
    pub fn of(outcome: Result<(), SandboxError>) -> Self {
        let err = match outcome {
            Ok(()) => return Disposition::Commit { report: true },
            Err(err) => err,
        };

        match err {
            SandboxError::AlreadyReserved
            | SandboxError::NotReserved
            | SandboxError::AlreadyReplied
            | SandboxError::AlreadyInvocating => Disposition::Empty(StatusCode::BAD_REQUEST),
            SandboxError::InternalServerError => {
                Disposition::Empty(StatusCode::INTERNAL_SERVER_ERROR)
            }
            SandboxError::InitDoneFailed | SandboxError::InvokeDoneFailed => {
                Disposition::Diagnostic(StatusCode::BAD_GATEWAY)
            }
            SandboxError::ReserveReservationDone
            | SandboxError::InvokeReservationDone
            | SandboxError::ReleaseReservationDone => {
                Disposition::Empty(StatusCode::GATEWAY_TIMEOUT)
            }
            SandboxError::InvokeResponseAlreadyWritten => Disposition::Commit { report: false },
            SandboxError::InvokeTimeout => Disposition::TimedOut,
        }
    }
}

/// The message sent when the sandbox reports a timeout.
pub fn timeout_message(timeout_secs: u64) -> String {
    format!("Task timed out after {timeout_secs}.00 seconds")
}

/// Builds invocation requests, drives the sandbox and maps its outcomes.
pub struct Dispatcher {
    sandbox: Arc<dyn Sandbox>,
    gate: InitGate,
    config: Arc<EmulatorConfig>,
    environment: Arc<EnvironmentSnapshot>,
    bootstrap: Bootstrap,
    reporter: TelemetryReporter,
}

impl Dispatcher {
    /// Creates a dispatcher whose init gate has not fired yet.
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        config: Arc<EmulatorConfig>,
        environment: Arc<EnvironmentSnapshot>,
        bootstrap: Bootstrap,
        reporter: TelemetryReporter,
    ) -> Self {
        Self {
            sandbox,
            gate: InitGate::new(),
            config,
            environment,
            bootstrap,
            reporter,
        }
    }

    /// The resolved configuration.
    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Whether the sandbox has been initialised.
    pub fn is_initialized(&self) -> bool {
        self.gate.is_initialized()
    }

    /// Builds the invocation request for an inbound call.
    pub fn build_request(&self, headers: &HeaderMap, payload: Bytes) -> InvocationRequest {
        InvocationRequest {
            id: uuid::Uuid::new_v4().to_string(),
            invoked_function_arn: self.config.invoked_function_arn(),
            trace_id: header_value(headers, TRACE_ID_HEADER),
            lambda_segment_id: header_value(headers, SEGMENT_ID_HEADER),
            payload,
        }
    }

    /// Invokes the function with `payload` and produces the HTTP answer.
    pub async fn dispatch(&self, headers: &HeaderMap, payload: Bytes) -> Response {
        let init_duration_ms = self
            .gate
            .ensure_initialized(
                self.sandbox.as_ref(),
                &self.config,
                &self.environment,
                &self.bootstrap,
            )
            .await
            .map(|outcome| outcome.duration_ms);

        let request = self.build_request(headers, payload);
        let request_id = request.id.clone();

        self.reporter
            .start(&request_id, &self.config.function_version);

        let invoke_start = Instant::now();
        let mut buffer = ResponseBuffer::new();
        let outcome = self.sandbox.invoke(&mut buffer, request).await;

        tracing::debug!(request_id = %request_id, ?outcome, "Sandbox invoke returned");

        let report = || {
            self.reporter.end(
                &request_id,
                init_duration_ms,
                &self.config.memory_size,
                invoke_start.elapsed(),
                self.config.function_timeout,
            );
        };

        match Disposition::of(outcome) {
            Disposition::Commit { report: emit } => {
                if emit {
                    report();
                }
                commit(buffer)
            }
            Disposition::Empty(status) => {
                if let Err(err) = outcome {
                    log_rejection(err);
                }
                status.into_response()
            }
            Disposition::Diagnostic(status) => {
                let (_, body) = buffer.into_parts();
                (status, body).into_response()
            }
            Disposition::TimedOut => {
                report();
                let body = timeout_message(self.config.timeout_secs());
                tokio::time::sleep(TIMEOUT_PAUSE).await;
                (StatusCode::OK, body).into_response()
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("initialized", &self.gate.is_initialized())
            .finish_non_exhaustive()
    }
}

fn commit(buffer: ResponseBuffer) -> Response {
    let (status, body) = buffer.into_parts();
    (status.unwrap_or(StatusCode::OK), body).into_response()
}

fn log_rejection(err: SandboxError) {
    match err {
        SandboxError::AlreadyReserved => tracing::error!("Failed to reserve: {}", err),
        SandboxError::NotReserved
        | SandboxError::AlreadyReplied
        | SandboxError::AlreadyInvocating => {
            tracing::error!("Failed to set reply stream: {}", err)
        }
        _ => tracing::debug!("Invoke rejected: {}", err),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_every_outcome_is_mapped() {
        let expected: HashMap<SandboxError, Disposition> = HashMap::from([
            (
                SandboxError::AlreadyReserved,
                Disposition::Empty(StatusCode::BAD_REQUEST),
            ),
            (
                SandboxError::InternalServerError,
                Disposition::Empty(StatusCode::INTERNAL_SERVER_ERROR),
            ),
            (
                SandboxError::InitDoneFailed,
                Disposition::Diagnostic(StatusCode::BAD_GATEWAY),
            ),
            (
                SandboxError::ReserveReservationDone,
                Disposition::Empty(StatusCode::GATEWAY_TIMEOUT),
            ),
            (
                SandboxError::NotReserved,
                Disposition::Empty(StatusCode::BAD_REQUEST),
            ),
            (
                SandboxError::AlreadyReplied,
                Disposition::Empty(StatusCode::BAD_REQUEST),
            ),
            (
                SandboxError::AlreadyInvocating,
                Disposition::Empty(StatusCode::BAD_REQUEST),
            ),
            (
                SandboxError::InvokeReservationDone,
                Disposition::Empty(StatusCode::GATEWAY_TIMEOUT),
            ),
            (
                SandboxError::InvokeResponseAlreadyWritten,
                Disposition::Commit { report: false },
            ),
            (
                SandboxError::InvokeDoneFailed,
                Disposition::Diagnostic(StatusCode::BAD_GATEWAY),
            ),
            (
                SandboxError::ReleaseReservationDone,
                Disposition::Empty(StatusCode::GATEWAY_TIMEOUT),
            ),
            (SandboxError::InvokeTimeout, Disposition::TimedOut),
        ]);

        assert_eq!(expected.len(), SandboxError::ALL.len());
        for kind in SandboxError::ALL {
            assert_eq!(Disposition::of(Err(kind)), expected[&kind], "{kind:?}");
        }
        assert_eq!(Disposition::of(Ok(())), Disposition::Commit { report: true });
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(timeout_message(5), "Task timed out after 5.00 seconds");
        assert_eq!(timeout_message(300), "Task timed out after 300.00 seconds");
    }

    #[test]
    fn test_header_value_missing_is_empty() {
        let mut headers = HeaderMap::new();
        headers.insert("x-amzn-trace-id", "Root=1-abc".parse().unwrap());

        assert_eq!(header_value(&headers, TRACE_ID_HEADER), "Root=1-abc");
        assert_eq!(header_value(&headers, SEGMENT_ID_HEADER), "");
    }
}
