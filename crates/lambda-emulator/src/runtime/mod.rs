//! A local sandbox that speaks the Lambda Runtime API.
//!
//! [`RuntimeApiSandbox`] serves the Runtime API on its own listener and
//! optionally spawns the bootstrap process pointed at it. Any runtime client
//! that follows the Runtime API (for example `lambda_runtime`) can serve
//! invocations dispatched by the emulator.
//!
//! Init completes when the runtime first polls `/invocation/next` and fails
//! if it posts `/init/error`, exits, or has not connected within
//! [`INIT_TIMEOUT`].

mod api;
pub mod process;
mod state;

use crate::error::{InitError, RuntimeApiError};
use crate::sandbox::{InitDescriptor, InvocationRequest, ResponseBuffer, Sandbox, SandboxError};
use api::{RuntimeApiState, create_runtime_api_router};
use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use serde_json::{Value, json};
use state::{InitPhase, PendingInvocation, RuntimeReply, RuntimeState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// How long init waits for the runtime to poll for its first invocation.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A sandbox backed by a local Runtime API server.
pub struct RuntimeApiSandbox {
    state: Arc<RuntimeState>,
    addr: SocketAddr,
    reservation: tokio::sync::Mutex<()>,
    invoke_timeout_ms: AtomicU64,
    server_handle: JoinHandle<()>,
    process_watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeApiSandbox {
    /// Binds the Runtime API on `addr` and starts serving it.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeApiError::Bind`] if the listener cannot bind.
    pub async fn start(addr: SocketAddr) -> Result<Self, RuntimeApiError> {
        let bind_error = |source| RuntimeApiError::Bind { addr, source };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let state = Arc::new(RuntimeState::new());
        let router = create_runtime_api_router(RuntimeApiState {
            runtime: Arc::clone(&state),
        });

        let server_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("Runtime API server stopped: {}", e);
            }
        });

        tracing::info!("Runtime API listening on {}", local_addr);

        Ok(Self {
            state,
            addr: local_addr,
            reservation: tokio::sync::Mutex::new(()),
            invoke_timeout_ms: AtomicU64::new(crate::config::DEFAULT_TIMEOUT_SECS * 1000),
            server_handle,
            process_watcher: parking_lot::Mutex::new(None),
        })
    }

    /// The address runtimes should use as `AWS_LAMBDA_RUNTIME_API`.
    pub fn runtime_api_addr(&self) -> SocketAddr {
        self.addr
    }

    fn launch(&self, descriptor: &InitDescriptor) -> Result<(), InitError> {
        let env = process::runtime_environment(descriptor, self.addr);
        let mut child = match process::spawn_runtime(&descriptor.bootstrap, env) {
            Ok(child) => child,
            Err(e) => {
                let message = e.to_string();
                self.state
                    .fail_init(error_document("Runtime.InvalidEntrypoint", &message));
                return Err(InitError::new(message));
            }
        };

        let state = Arc::clone(&self.state);
        let watcher = tokio::spawn(async move {
            let status = child.wait().await;
            let reason = process::describe_exit(&status);
            tracing::warn!(
                pid = ?child.pid(),
                "Runtime {} exited: {}",
                child.binary_name(),
                reason
            );
            let init_document = error_document(
                "Runtime.ExitError",
                &format!("Runtime exited with error: {reason}"),
            );
            state.runtime_exited(reason, init_document).await;
        });

        if let Some(previous) = self.process_watcher.lock().replace(watcher) {
            previous.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for RuntimeApiSandbox {
    async fn init(
        &self,
        descriptor: InitDescriptor,
        invoke_timeout_ms: u64,
    ) -> Result<(), InitError> {
        self.invoke_timeout_ms
            .store(invoke_timeout_ms, Ordering::SeqCst);

        if descriptor.bootstrap.is_external() {
            tracing::info!(
                "Waiting for an external runtime on AWS_LAMBDA_RUNTIME_API={}",
                self.addr
            );
        } else {
            self.launch(&descriptor)?;
        }

        match tokio::time::timeout(INIT_TIMEOUT, self.state.wait_for_init()).await {
            Ok(InitPhase::Ready) => Ok(()),
            Ok(InitPhase::Failed | InitPhase::Pending) => {
                let message = self
                    .state
                    .init_error()
                    .map(|doc| describe_document(&doc))
                    .unwrap_or_else(|| "init failed".to_string());
                Err(InitError::new(message))
            }
            Err(_) => {
                let message = format!(
                    "Runtime did not poll for invocations within {} seconds",
                    INIT_TIMEOUT.as_secs()
                );
                self.state
                    .fail_init(error_document("Sandbox.Timedout", &message));
                Err(InitError::new(message))
            }
        }
    }

    async fn invoke(
        &self,
        response: &mut ResponseBuffer,
        request: InvocationRequest,
    ) -> Result<(), SandboxError> {
        let Ok(_reservation) = self.reservation.try_lock() else {
            return Err(SandboxError::AlreadyReserved);
        };

        if self.state.phase() == InitPhase::Failed {
            if let Some(document) = self.state.init_error() {
                response.write(&document);
            }
            return Err(SandboxError::InitDoneFailed);
        }

        let request_id = request.id.clone();
        let timeout_ms = self.invoke_timeout_ms.load(Ordering::SeqCst);

        let reply = match self
            .state
            .enqueue(PendingInvocation::new(request, timeout_ms))
            .await
        {
            Ok(reply) => reply,
            Err(reason) => {
                response.write(&exit_document(&request_id, &reason));
                return Err(SandboxError::InvokeDoneFailed);
            }
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), reply).await {
            Ok(Ok(RuntimeReply::Response(body) | RuntimeReply::Error(body))) => {
                response.set_status(StatusCode::OK);
                response.write(&body);
                Ok(())
            }
            Ok(Ok(RuntimeReply::Exited(reason))) => {
                response.write(&exit_document(&request_id, &reason));
                Err(SandboxError::InvokeDoneFailed)
            }
            Ok(Err(_)) => {
                tracing::error!(%request_id, "Reply channel closed without a reply");
                Err(SandboxError::InternalServerError)
            }
            Err(_) => {
                self.state.abandon(&request_id).await;
                Err(SandboxError::InvokeTimeout)
            }
        }
    }
}

impl Drop for RuntimeApiSandbox {
    fn drop(&mut self) {
        self.server_handle.abort();
        if let Some(watcher) = self.process_watcher.lock().take() {
            watcher.abort();
        }
    }
}

impl std::fmt::Debug for RuntimeApiSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeApiSandbox")
            .field("addr", &self.addr)
            .field("phase", &self.state.phase())
            .finish_non_exhaustive()
    }
}

fn error_document(error_type: &str, message: &str) -> Bytes {
    Bytes::from(
        json!({
            "errorMessage": message,
            "errorType": error_type,
        })
        .to_string(),
    )
}

fn exit_document(request_id: &str, reason: &str) -> Bytes {
    error_document(
        "Runtime.ExitError",
        &format!("RequestId: {request_id} Error: Runtime exited with error: {reason}"),
    )
}

/// `errorType: errorMessage` from an error document, or its raw text.
fn describe_document(document: &[u8]) -> String {
    match serde_json::from_slice::<Value>(document) {
        Ok(value) => {
            let error_type = value
                .get("errorType")
                .and_then(|v| v.as_str())
                .unwrap_or("UnknownError");
            let error_message = value
                .get("errorMessage")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown error");
            format!("{}: {}", error_type, error_message)
        }
        Err(_) => String::from_utf8_lossy(document).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatorConfig;
    use crate::environment::EnvironmentSnapshot;
    use crate::init_gate::build_descriptor;
    use crate::sandbox::Bootstrap;
    use tokio::sync::oneshot;

    const FUNCTION_ERROR_TYPE: &str = "Lambda-Runtime-Function-Error-Type";

    async fn sandbox() -> Arc<RuntimeApiSandbox> {
        Arc::new(
            RuntimeApiSandbox::start(([127, 0, 0, 1], 0).into())
                .await
                .unwrap(),
        )
    }

    fn runtime_url(sandbox: &RuntimeApiSandbox, path: &str) -> String {
        format!("http://{}/2018-06-01/runtime{}", sandbox.runtime_api_addr(), path)
    }

    fn descriptor(bootstrap: Bootstrap) -> InitDescriptor {
        build_descriptor(
            &EmulatorConfig::default(),
            &EnvironmentSnapshot::capture(),
            &bootstrap,
        )
    }

    fn request(id: &str, payload: &'static [u8]) -> InvocationRequest {
        InvocationRequest {
            id: id.to_string(),
            invoked_function_arn: EmulatorConfig::default().invoked_function_arn(),
            trace_id: "Root=1-abc".to_string(),
            lambda_segment_id: String::new(),
            payload: Bytes::from_static(payload),
        }
    }

    /// Polls `/next` once and hands back the request id, headers and payload.
    async fn poll_next(
        client: &reqwest::Client,
        url: &str,
    ) -> (String, reqwest::header::HeaderMap, String) {
        let resp = client.get(url).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let headers = resp.headers().clone();
        let id = headers["lambda-runtime-aws-request-id"]
            .to_str()
            .unwrap()
            .to_string();
        (id, headers, resp.text().await.unwrap())
    }

    /// Runs init against an external runtime that first polls `/next`,
    /// returning a channel yielding what that first poll received.
    async fn init_with_external_runtime(
        sandbox: &Arc<RuntimeApiSandbox>,
        timeout_ms: u64,
    ) -> oneshot::Receiver<(String, reqwest::header::HeaderMap, String)> {
        let (tx, rx) = oneshot::channel();
        let next_url = runtime_url(sandbox, "/invocation/next");
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let _ = tx.send(poll_next(&client, &next_url).await);
        });

        sandbox
            .init(descriptor(Bootstrap::external()), timeout_ms)
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let sandbox = sandbox().await;
        let first_poll = init_with_external_runtime(&sandbox, 5_000).await;

        let response_base = runtime_url(&sandbox, "/invocation");
        let runtime = tokio::spawn(async move {
            let (id, headers, body) = first_poll.await.unwrap();
            assert_eq!(body, r#"{"n":1}"#);
            assert_eq!(headers["lambda-runtime-trace-id"], "Root=1-abc");
            assert_eq!(
                headers["lambda-runtime-invoked-function-arn"],
                "arn:aws:lambda:us-east-1:012345678912:function:test_function"
            );
            let deadline: i64 = headers["lambda-runtime-deadline-ms"]
                .to_str()
                .unwrap()
                .parse()
                .unwrap();
            assert!(deadline > chrono::Utc::now().timestamp_millis());

            let status = reqwest::Client::new()
                .post(format!("{response_base}/{id}/response"))
                .body(r#"{"ok":true}"#)
                .send()
                .await
                .unwrap()
                .status();
            assert_eq!(status, 202);
        });

        let mut buffer = ResponseBuffer::new();
        let outcome = sandbox.invoke(&mut buffer, request("req-1", br#"{"n":1}"#)).await;
        runtime.await.unwrap();

        assert_eq!(outcome, Ok(()));
        assert_eq!(buffer.status(), Some(StatusCode::OK));
        assert_eq!(buffer.body(), br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_function_error_is_a_successful_invoke() {
        let sandbox = sandbox().await;
        let first_poll = init_with_external_runtime(&sandbox, 5_000).await;

        let response_base = runtime_url(&sandbox, "/invocation");
        tokio::spawn(async move {
            let (id, _, _) = first_poll.await.unwrap();
            reqwest::Client::new()
                .post(format!("{response_base}/{id}/error"))
                .header(FUNCTION_ERROR_TYPE, "Unhandled")
                .body(r#"{"errorType":"Boom","errorMessage":"bad input"}"#)
                .send()
                .await
                .unwrap();
        });

        let mut buffer = ResponseBuffer::new();
        let outcome = sandbox.invoke(&mut buffer, request("req-err", b"{}")).await;

        assert_eq!(outcome, Ok(()));
        assert_eq!(buffer.status(), Some(StatusCode::OK));
        assert!(String::from_utf8_lossy(buffer.body()).contains("bad input"));
    }

    #[tokio::test]
    async fn test_concurrent_invoke_is_rejected() {
        let sandbox = sandbox().await;
        let first_poll = init_with_external_runtime(&sandbox, 5_000).await;

        let busy = Arc::clone(&sandbox);
        let in_flight = tokio::spawn(async move {
            let mut buffer = ResponseBuffer::new();
            let outcome = busy.invoke(&mut buffer, request("held", b"{}")).await;
            (outcome, buffer)
        });

        let (id, _, _) = first_poll.await.unwrap();
        assert_eq!(id, "held");

        let mut buffer = ResponseBuffer::new();
        let second = sandbox.invoke(&mut buffer, request("second", b"{}")).await;
        assert_eq!(second, Err(SandboxError::AlreadyReserved));

        reqwest::Client::new()
            .post(runtime_url(&sandbox, &format!("/invocation/{id}/response")))
            .body("done")
            .send()
            .await
            .unwrap();

        let (outcome, buffer) = in_flight.await.unwrap();
        assert_eq!(outcome, Ok(()));
        assert_eq!(buffer.body(), b"done");
    }

    #[tokio::test]
    async fn test_invoke_timeout_and_late_reply() {
        let sandbox = sandbox().await;
        let first_poll = init_with_external_runtime(&sandbox, 200).await;

        let mut buffer = ResponseBuffer::new();
        let outcome = sandbox.invoke(&mut buffer, request("slow", b"{}")).await;
        assert_eq!(outcome, Err(SandboxError::InvokeTimeout));

        let (id, _, _) = first_poll.await.unwrap();
        let late = reqwest::Client::new()
            .post(runtime_url(&sandbox, &format!("/invocation/{id}/response")))
            .body("too late")
            .send()
            .await
            .unwrap();
        assert_eq!(late.status(), 404);
    }

    #[tokio::test]
    async fn test_unknown_request_id() {
        let sandbox = sandbox().await;
        let resp = reqwest::Client::new()
            .post(runtime_url(&sandbox, "/invocation/nope/error"))
            .body("{}")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 404);
        assert_eq!(resp.text().await.unwrap(), "Unknown request ID: nope");
    }

    #[tokio::test]
    async fn test_init_error_fails_every_invoke() {
        let sandbox = sandbox().await;
        let init_error_url = runtime_url(&sandbox, "/init/error");
        tokio::spawn(async move {
            let status = reqwest::Client::new()
                .post(init_error_url)
                .body(r#"{"errorType":"Runtime.ImportModuleError","errorMessage":"no module"}"#)
                .send()
                .await
                .unwrap()
                .status();
            assert_eq!(status, 202);
        });

        let err = sandbox
            .init(descriptor(Bootstrap::external()), 5_000)
            .await
            .unwrap_err();
        assert_eq!(err.message, "Runtime.ImportModuleError: no module");

        for id in ["a", "b"] {
            let mut buffer = ResponseBuffer::new();
            let outcome = sandbox.invoke(&mut buffer, request(id, b"{}")).await;
            assert_eq!(outcome, Err(SandboxError::InitDoneFailed));
            assert!(String::from_utf8_lossy(buffer.body()).contains("ImportModuleError"));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exiting_bootstrap_fails_init() {
        let sandbox = sandbox().await;

        let err = sandbox
            .init(descriptor(Bootstrap::new(["sh", "-c", "exit 3"])), 5_000)
            .await
            .unwrap_err();
        assert_eq!(
            err.message,
            "Runtime.ExitError: Runtime exited with error: exit status 3"
        );

        let mut buffer = ResponseBuffer::new();
        let outcome = sandbox.invoke(&mut buffer, request("after-exit", b"{}")).await;
        assert_eq!(outcome, Err(SandboxError::InitDoneFailed));

        let document: Value = serde_json::from_slice(buffer.body()).unwrap();
        assert_eq!(document["errorType"], "Runtime.ExitError");
    }

    #[tokio::test]
    async fn test_missing_bootstrap_fails_init() {
        let sandbox = sandbox().await;
        let err = sandbox
            .init(descriptor(Bootstrap::new(["/nonexistent/bootstrap"])), 5_000)
            .await
            .unwrap_err();
        assert!(err.message.contains("/nonexistent/bootstrap"));

        let mut buffer = ResponseBuffer::new();
        let outcome = sandbox.invoke(&mut buffer, request("x", b"{}")).await;
        assert_eq!(outcome, Err(SandboxError::InitDoneFailed));
        assert!(String::from_utf8_lossy(buffer.body()).contains("Runtime.InvalidEntrypoint"));
    }

    #[test]
    fn test_describe_document() {
        assert_eq!(
            describe_document(br#"{"errorType":"A","errorMessage":"b"}"#),
            "A: b"
        );
        assert_eq!(describe_document(b"{}"), "UnknownError: Unknown error");
        assert_eq!(describe_document(b"plain text"), "plain text");
    }

    #[test]
    fn test_exit_document() {
        let document: Value = serde_json::from_slice(&exit_document("id-1", "exit status 1")).unwrap();
        assert_eq!(
            document,
            json!({
                "errorType": "Runtime.ExitError",
                "errorMessage": "RequestId: id-1 Error: Runtime exited with error: exit status 1"
            })
        );
    }
}
