//! State shared between the Runtime API handlers and the sandbox.

use crate::sandbox::InvocationRequest;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, Notify, oneshot, watch};

/// What the runtime reported for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RuntimeReply {
    /// Body posted to `/response`.
    Response(Bytes),
    /// Body posted to `/error`.
    Error(Bytes),
    /// The runtime process exited before replying.
    Exited(String),
}

/// Init lifecycle as observed through the Runtime API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InitPhase {
    /// Waiting for the first `/next` or `/init/error`.
    Pending,
    /// The runtime polled `/next`.
    Ready,
    /// The runtime reported an init error, exited, or never showed up.
    Failed,
}

/// Whether a runtime reply matched an outstanding invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyOutcome {
    Accepted,
    UnknownRequest,
}

/// An invocation queued for the runtime.
#[derive(Debug, Clone)]
pub(crate) struct PendingInvocation {
    pub request: InvocationRequest,
    pub deadline: DateTime<Utc>,
}

impl PendingInvocation {
    pub fn new(request: InvocationRequest, timeout_ms: u64) -> Self {
        let now = Utc::now();
        let deadline = i64::try_from(timeout_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { request, deadline }
    }

    /// Deadline as milliseconds since the Unix epoch, for `Lambda-Runtime-Deadline-Ms`.
    pub fn deadline_ms(&self) -> i64 {
        self.deadline.timestamp_millis()
    }
}

#[derive(Debug)]
pub(crate) struct RuntimeState {
    /// Invocations the runtime has not fetched yet.
    pending: Mutex<VecDeque<PendingInvocation>>,

    /// Reply channels keyed by request id, for queued and fetched invocations.
    waiting: Mutex<HashMap<String, oneshot::Sender<RuntimeReply>>>,

    invocation_available: Notify,

    phase: watch::Sender<InitPhase>,

    /// Error document recorded when init failed.
    init_error: parking_lot::Mutex<Option<Bytes>>,

    /// Set once the runtime process has exited.
    exit_reason: parking_lot::Mutex<Option<String>>,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            waiting: Mutex::new(HashMap::new()),
            invocation_available: Notify::new(),
            phase: watch::Sender::new(InitPhase::Pending),
            init_error: parking_lot::Mutex::new(None),
            exit_reason: parking_lot::Mutex::new(None),
        }
    }

    /// Queues an invocation and returns the channel its reply arrives on.
    ///
    /// Fails with the exit reason if the runtime is already gone.
    pub async fn enqueue(
        &self,
        invocation: PendingInvocation,
    ) -> Result<oneshot::Receiver<RuntimeReply>, String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiting = self.waiting.lock().await;
            if let Some(reason) = self.exit_reason() {
                return Err(reason);
            }
            waiting.insert(invocation.request.id.clone(), tx);
        }

        self.pending.lock().await.push_back(invocation);
        self.invocation_available.notify_one();
        Ok(rx)
    }

    /// Waits for and dequeues the next invocation.
    pub async fn next_invocation(&self) -> PendingInvocation {
        loop {
            if let Some(invocation) = self.pending.lock().await.pop_front() {
                return invocation;
            }
            self.invocation_available.notified().await;
        }
    }

    /// Delivers a runtime reply. The first reply for an id wins.
    pub async fn reply(&self, request_id: &str, reply: RuntimeReply) -> ReplyOutcome {
        match self.waiting.lock().await.remove(request_id) {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    tracing::debug!(request_id, "Reply arrived after the caller gave up");
                }
                ReplyOutcome::Accepted
            }
            None => ReplyOutcome::UnknownRequest,
        }
    }

    /// Forgets an invocation whose caller stopped waiting.
    pub async fn abandon(&self, request_id: &str) {
        self.waiting.lock().await.remove(request_id);
        self.pending
            .lock()
            .await
            .retain(|inv| inv.request.id != request_id);
    }

    pub fn phase(&self) -> InitPhase {
        *self.phase.borrow()
    }

    /// Moves from `Pending` to `Ready`. Later calls are no-ops.
    pub fn mark_ready(&self) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase == InitPhase::Pending {
                *phase = InitPhase::Ready;
                true
            } else {
                false
            }
        })
    }

    /// Moves from `Pending` to `Failed`, recording `document`.
    ///
    /// Returns `false` if init had already settled.
    pub fn fail_init(&self, document: Bytes) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase == InitPhase::Pending {
                *self.init_error.lock() = Some(document.clone());
                *phase = InitPhase::Failed;
                true
            } else {
                false
            }
        })
    }

    /// Waits until init leaves `Pending`.
    pub async fn wait_for_init(&self) -> InitPhase {
        let mut rx = self.phase.subscribe();
        match rx.wait_for(|phase| *phase != InitPhase::Pending).await {
            Ok(phase) => *phase,
            Err(_) => InitPhase::Failed,
        }
    }

    pub fn init_error(&self) -> Option<Bytes> {
        self.init_error.lock().clone()
    }

    pub fn exit_reason(&self) -> Option<String> {
        self.exit_reason.lock().clone()
    }

    /// Records that the runtime process is gone.
    ///
    /// Fails a pending init and answers every outstanding invocation.
    pub async fn runtime_exited(&self, reason: String, init_document: Bytes) {
        *self.exit_reason.lock() = Some(reason.clone());
        self.fail_init(init_document);

        let waiting: Vec<_> = self.waiting.lock().await.drain().collect();
        for (request_id, tx) in waiting {
            if tx.send(RuntimeReply::Exited(reason.clone())).is_err() {
                tracing::debug!(request_id, "Caller gone before runtime exit was reported");
            }
        }
        self.pending.lock().await.clear();
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}
