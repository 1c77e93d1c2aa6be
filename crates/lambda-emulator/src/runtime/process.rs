//! Spawning and supervising the runtime bootstrap process.
//!
//! The child sees the captured environment snapshot plus the variables a
//! runtime client needs to find the Runtime API. Stdout and stderr are
//! inherited so function logs interleave with START/END/REPORT lines.

use crate::sandbox::{Bootstrap, InitDescriptor};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::{Child, Command};

/// A managed runtime process, killed on drop if still running.
pub struct ManagedProcess {
    child: Child,
    pid: Option<u32>,
    binary_name: String,
}

impl ManagedProcess {
    /// The process id, if the child had not exited when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The program name (for logging).
    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    /// Waits for the process to exit.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.start_kill();
        }
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("pid", &self.pid)
            .field("binary_name", &self.binary_name)
            .finish()
    }
}

/// Errors raised while starting the runtime.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The bootstrap has no command.
    #[error("Bootstrap command is empty")]
    EmptyCommand,

    /// The bootstrap path does not exist.
    #[error("Binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),

    /// The OS refused to start the process.
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[source] io::Error),
}

/// The environment the runtime process starts with.
///
/// The snapshot comes first; descriptor fields and the Runtime API address
/// are layered on top. Unset credentials are left out.
pub fn runtime_environment(
    descriptor: &InitDescriptor,
    runtime_api: SocketAddr,
) -> BTreeMap<String, String> {
    let mut overlay = vec![
        ("AWS_LAMBDA_RUNTIME_API", runtime_api.to_string()),
        ("AWS_LAMBDA_FUNCTION_NAME", descriptor.function_name.clone()),
        (
            "AWS_LAMBDA_FUNCTION_VERSION",
            descriptor.function_version.clone(),
        ),
        (
            "AWS_XRAY_DAEMON_ADDRESS",
            descriptor.xray_daemon_address.clone(),
        ),
    ];

    if !descriptor.handler.is_empty() {
        overlay.push(("_HANDLER", descriptor.handler.clone()));
    }

    let credentials = &descriptor.credentials;
    for (key, value) in [
        ("AWS_ACCESS_KEY_ID", &credentials.access_key_id),
        ("AWS_SECRET_ACCESS_KEY", &credentials.secret_access_key),
        ("AWS_SESSION_TOKEN", &credentials.session_token),
    ] {
        if let Some(value) = value {
            overlay.push((key, value.clone()));
        }
    }

    descriptor.environment.overlaid(overlay).into_inner()
}

/// Spawns the bootstrap command with exactly `env` as its environment.
pub fn spawn_runtime(
    bootstrap: &Bootstrap,
    env: BTreeMap<String, String>,
) -> Result<ManagedProcess, ProcessError> {
    let (program, args) = bootstrap
        .command()
        .split_first()
        .ok_or(ProcessError::EmptyCommand)?;

    let program_path = Path::new(program);
    if program.contains('/') && !program_path.exists() {
        return Err(ProcessError::BinaryNotFound(program_path.to_path_buf()));
    }

    let binary_name = program_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    if let Some(dir) = bootstrap.cwd() {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(ProcessError::SpawnFailed)?;
    let pid = child.id();

    tracing::debug!("Spawned runtime process: {} (PID: {:?})", binary_name, pid);

    Ok(ManagedProcess {
        child,
        pid,
        binary_name,
    })
}

/// Describes how the process ended, e.g. `exit status 3` or `signal: killed`.
pub fn describe_exit(status: &io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => match status.code() {
            Some(code) => format!("exit status {code}"),
            None => status.to_string(),
        },
        Err(e) => format!("wait failed: {e}"),
    }
}
