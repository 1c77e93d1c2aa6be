//! HTTP surface and emulator orchestration.
//!
//! - `POST /2015-03-31/functions/function/invocations` - body passed through as the payload
//! - `POST /` and `POST /{*path}` - function URL style, translated to an [`EventEnvelope`]

use crate::config::EmulatorConfig;
use crate::dispatch::Dispatcher;
use crate::environment::EnvironmentSnapshot;
use crate::error::{EmulatorError, EmulatorResult, TranslateError};
use crate::event::EventEnvelope;
use crate::report::TelemetryReporter;
use crate::sandbox::{Bootstrap, Sandbox};
use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Path of the platform-style invoke endpoint.
pub const INVOCATIONS_PATH: &str = "/2015-03-31/functions/function/invocations";

/// Shared state for the invoke endpoints.
#[derive(Clone)]
pub(crate) struct InvokeApiState {
    pub dispatcher: Arc<Dispatcher>,
}

/// Creates the invoke router around a dispatcher.
pub fn create_invoke_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route(INVOCATIONS_PATH, post(invoke).fallback(unsupported_method))
        .route("/", post(direct_invoke_root).fallback(unsupported_method))
        .route("/{*path}", post(direct_invoke).fallback(unsupported_method))
        .with_state(InvokeApiState { dispatcher })
}

/// Every path is routed, so only the method can be wrong.
async fn unsupported_method(method: Method, uri: Uri) -> StatusCode {
    tracing::warn!(%method, %uri, "Unhandled request");
    StatusCode::METHOD_NOT_ALLOWED
}

async fn read_body(body: Body) -> Result<Bytes, TranslateError> {
    axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(TranslateError::BodyRead)
}

/// POST /2015-03-31/functions/function/invocations
async fn invoke(State(state): State<InvokeApiState>, headers: HeaderMap, body: Body) -> Response {
    tracing::debug!(?headers, "invoke: -> POST {}", INVOCATIONS_PATH);

    let payload = match read_body(body).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("{}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    state.dispatcher.dispatch(&headers, payload).await
}

/// POST /
async fn direct_invoke_root(
    state: State<InvokeApiState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    direct_invoke(state, Path(String::new()), method, uri, headers, body).await
}

/// POST /{*path}
///
/// Maps the request to a function URL event and invokes with it as the payload.
/// The path remainder arrives percent-decoded.
async fn direct_invoke(
    State(state): State<InvokeApiState>,
    Path(wildcard): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    tracing::debug!(?headers, "direct invoke: -> {} {}", method, uri);

    let payload = match translate(&method, &wildcard, &uri, &headers, body).await {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!("{}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    state.dispatcher.dispatch(&headers, payload).await
}

async fn translate(
    method: &Method,
    wildcard: &str,
    uri: &Uri,
    headers: &HeaderMap,
    body: Body,
) -> Result<Bytes, TranslateError> {
    let raw_body = read_body(body).await?;

    EventEnvelope::from_parts(method, wildcard, uri, headers, &raw_body).to_payload()
}

/// Builder for a running [`Emulator`].
///
/// # Examples
///
/// ```no_run
/// use lambda_emulator::{Emulator, RuntimeApiSandbox};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let sandbox = RuntimeApiSandbox::start(([127, 0, 0, 1], 9001).into()).await?;
/// let emulator = Emulator::builder()
///     .sandbox(Arc::new(sandbox))
///     .port(8080)
///     .build()
///     .await?;
/// println!("Invoke at {}", emulator.invocations_url());
/// # Ok(())
/// # }
/// ```
#[must_use = "builders do nothing unless .build() is called"]
pub struct EmulatorBuilder {
    sandbox: Option<Arc<dyn Sandbox>>,
    config: Option<EmulatorConfig>,
    environment: Option<EnvironmentSnapshot>,
    bootstrap: Bootstrap,
    reporter: TelemetryReporter,
    addr: SocketAddr,
}

impl Default for EmulatorBuilder {
    fn default() -> Self {
        Self {
            sandbox: None,
            config: None,
            environment: None,
            bootstrap: Bootstrap::external(),
            reporter: TelemetryReporter::stdout(),
            addr: ([127, 0, 0, 1], 0).into(),
        }
    }
}

impl EmulatorBuilder {
    /// Creates a builder listening on an ephemeral loopback port.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sandbox invocations are dispatched to. Required.
    pub fn sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Uses an explicit configuration instead of resolving it from the environment.
    pub fn config(mut self, config: EmulatorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the environment snapshot. Defaults to [`EnvironmentSnapshot::capture`].
    pub fn environment(mut self, environment: EnvironmentSnapshot) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Sets the runtime bootstrap handed to the sandbox at init.
    pub fn bootstrap(mut self, bootstrap: Bootstrap) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Sets where START/END/REPORT lines go. Defaults to stdout.
    pub fn reporter(mut self, reporter: TelemetryReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Sets the listen address.
    pub fn addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Listens on the given loopback port.
    pub fn port(mut self, port: u16) -> Self {
        self.addr = ([127, 0, 0, 1], port).into();
        self
    }

    /// Binds the listener and starts serving.
    ///
    /// # Errors
    ///
    /// Returns an error if no sandbox was set, the configuration cannot be
    /// resolved, or the listener cannot bind.
    pub async fn build(self) -> EmulatorResult<Emulator> {
        let sandbox = self.sandbox.ok_or_else(|| {
            EmulatorError::ServerStart("a sandbox is required".to_string())
        })?;
        let environment = self.environment.unwrap_or_else(EnvironmentSnapshot::capture);
        let config = match self.config {
            Some(config) => config,
            None => EmulatorConfig::load(&environment)?,
        };

        let dispatcher = Arc::new(Dispatcher::new(
            sandbox,
            Arc::new(config),
            Arc::new(environment),
            self.bootstrap,
            self.reporter,
        ));
        let router = create_invoke_router(Arc::clone(&dispatcher));

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| EmulatorError::BindError(e.to_string()))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| EmulatorError::ServerStart(e.to_string()))?;

        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .map_err(|e| EmulatorError::ServerStart(e.to_string()))
        });

        tracing::info!("Listening on {}", local_addr);

        Ok(Emulator {
            dispatcher,
            addr: local_addr,
            server_handle,
        })
    }
}

/// A running invoke endpoint.
pub struct Emulator {
    dispatcher: Arc<Dispatcher>,
    addr: SocketAddr,
    server_handle: JoinHandle<EmulatorResult<()>>,
}

impl Emulator {
    /// Creates a new emulator builder.
    pub fn builder() -> EmulatorBuilder {
        EmulatorBuilder::new()
    }

    /// Base URL of the emulator.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Full URL of the platform-style invoke endpoint.
    pub fn invocations_url(&self) -> String {
        format!("{}{}", self.url(), INVOCATIONS_PATH)
    }

    /// The socket address the emulator is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The resolved configuration.
    pub fn config(&self) -> &EmulatorConfig {
        self.dispatcher.config()
    }

    /// Whether the sandbox has been initialised by a first invoke.
    pub fn is_initialized(&self) -> bool {
        self.dispatcher.is_initialized()
    }

    /// Waits for the server task to exit.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the server.
    pub async fn wait(self) -> EmulatorResult<()> {
        match self.server_handle.await {
            Ok(result) => result,
            Err(e) => Err(EmulatorError::ServerStart(e.to_string())),
        }
    }

    /// Stops serving.
    pub async fn shutdown(self) {
        self.server_handle.abort();
        let _ = self.server_handle.await;
    }
}
