//! Process-wide session registry.
//!
//! An explicit object rather than ambient global state: it hands out test
//! ids, tracks live sessions for lookup and cancellation, and nothing else.
//! Sessions never share counters through it.

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::export::{ResultWriter, TestResult};
use crate::probe::derive_source_port;

use super::controller::SessionController;

/// What StartSession hands back to the caller
#[derive(Debug, Clone)]
pub struct StartInfo {
    pub test_id: String,
    /// The port actually bound; callers need it to correlate flows in
    /// external flow logs
    pub source_port: u16,
}

struct SessionHandle {
    cancel: CancellationToken,
    task: JoinHandle<TestResult>,
    source_port: u16,
}

pub struct SessionRegistry {
    /// Cancelling this stops every session started from this registry
    root: CancellationToken,
    next_seq: AtomicU64,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    results: Option<Arc<ResultWriter>>,
}

impl SessionRegistry {
    pub fn new(results: Option<ResultWriter>) -> Self {
        Self {
            root: CancellationToken::new(),
            next_seq: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
            results: results.map(Arc::new),
        }
    }

    /// Start a new session. Binds synchronously so bind errors surface here;
    /// the session itself runs as a background task until it completes or
    /// is stopped.
    pub fn start(&self, config: SessionConfig) -> Result<StartInfo> {
        config.validate()?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let test_id = format!("CONV-{:03}", seq);
        let candidate = config
            .source_port
            .unwrap_or_else(|| derive_source_port(seq));

        let cancel = self.root.child_token();
        let controller = SessionController::new(
            test_id.clone(),
            config,
            candidate,
            cancel.clone(),
            self.results.clone(),
        )?;
        let source_port = controller.source_port();

        let task = tokio::spawn(controller.run());
        self.sessions.lock().insert(
            test_id.clone(),
            SessionHandle {
                cancel,
                task,
                source_port,
            },
        );

        Ok(StartInfo {
            test_id,
            source_port,
        })
    }

    /// Stop a session early and return its finalized result
    pub async fn stop(&self, test_id: &str) -> Result<TestResult> {
        let handle = self
            .sessions
            .lock()
            .remove(test_id)
            .ok_or_else(|| anyhow!("unknown test id: {}", test_id))?;
        handle.cancel.cancel();
        handle
            .task
            .await
            .with_context(|| format!("session task failed: {}", test_id))
    }

    /// Wait for a session to complete on its own (duration expiry) and
    /// return its result
    pub async fn wait(&self, test_id: &str) -> Result<TestResult> {
        let handle = self
            .sessions
            .lock()
            .remove(test_id)
            .ok_or_else(|| anyhow!("unknown test id: {}", test_id))?;
        handle
            .task
            .await
            .with_context(|| format!("session task failed: {}", test_id))
    }

    /// Source port bound by a live session
    pub fn source_port(&self, test_id: &str) -> Option<u16> {
        self.sessions.lock().get(test_id).map(|h| h.source_port)
    }

    /// Ids of sessions still tracked, in start order
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort_by_key(|id| id_sequence(id));
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Request cooperative shutdown of every live session
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

/// Numeric suffix of a test id. Ids are zero-padded to three digits, so a
/// plain string sort would misplace the 1000th session; sorting on the
/// counter keeps start order regardless of padding.
fn id_sequence(id: &str) -> u64 {
    id.rsplit('-')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}
