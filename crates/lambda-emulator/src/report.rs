//! START / END / REPORT log lines in the platform's format.
//!
//! Peak memory is not observable from the adapter, so the configured memory
//! size is reported as both "Memory Size" and "Max Memory Used".

use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

/// Milliseconds in `elapsed`, capped at `ceiling`.
pub fn clamp_millis(elapsed: Duration, ceiling: Duration) -> f64 {
    elapsed.min(ceiling).as_nanos() as f64 / 1_000_000.0
}

/// Formats the optional init segment of a REPORT line.
fn init_segment(init_duration_ms: Option<f64>) -> String {
    init_duration_ms
        .map(|ms| format!("Init Duration: {ms:.2} ms\t"))
        .unwrap_or_default()
}

/// Builds the REPORT line for one invocation.
pub fn report_line(
    request_id: &str,
    init_duration_ms: Option<f64>,
    duration_ms: f64,
    memory_size: &str,
) -> String {
    format!(
        "REPORT RequestId: {request_id}\t{init}Duration: {duration_ms:.2} ms\t\
         Billed Duration: {billed:.0} ms\tMemory Size: {memory_size} MB\t\
         Max Memory Used: {memory_size} MB\t",
        init = init_segment(init_duration_ms),
        billed = duration_ms.ceil(),
    )
}

/// Writes platform log lines to a shared sink.
#[derive(Clone)]
pub struct TelemetryReporter {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl TelemetryReporter {
    /// A reporter that writes to standard output.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// A reporter that writes to an arbitrary sink.
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    /// Emits `START RequestId: <id> Version: <version>`.
    pub fn start(&self, request_id: &str, function_version: &str) {
        self.emit(&format!(
            "START RequestId: {request_id} Version: {function_version}"
        ));
    }

    /// Emits the END and REPORT lines for a finished invocation.
    ///
    /// `elapsed` is clamped to `timeout` before it is reported.
    pub fn end(
        &self,
        request_id: &str,
        init_duration_ms: Option<f64>,
        memory_size: &str,
        elapsed: Duration,
        timeout: Duration,
    ) {
        let duration_ms = clamp_millis(elapsed, timeout);
        self.emit(&format!("END RequestId: {request_id}"));
        self.emit(&report_line(
            request_id,
            init_duration_ms,
            duration_ms,
            memory_size,
        ));
    }

    fn emit(&self, line: &str) {
        let mut sink = self.sink.lock();
        if let Err(e) = writeln!(sink, "{line}").and_then(|_| sink.flush()) {
            tracing::warn!("Failed to write report line: {}", e);
        }
    }
}

impl Default for TelemetryReporter {
    fn default() -> Self {
        Self::stdout()
    }
}

impl std::fmt::Debug for TelemetryReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryReporter").finish_non_exhaustive()
    }
}

/// In-memory sink for asserting on emitted lines.
#[derive(Debug, Clone, Default)]
pub struct CapturedLines {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLines {
    /// Creates an empty capture buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// A reporter writing into this buffer.
    pub fn reporter(&self) -> TelemetryReporter {
        TelemetryReporter::new(self.clone())
    }

    /// All complete lines written so far.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.buffer.lock())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for CapturedLines {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
