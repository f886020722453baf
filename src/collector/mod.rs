/// Collector module
///
/// This module groups all logic responsible for:
/// - Running one listener per connected session
/// - Extracting links from text, buttons and attachments
/// - Writing classified links to the store
///
/// The collector layer sits between:
/// - Transport sessions (event sources)
/// - The link store (single shared sink)
///
/// Design notes:
/// - Protocol-specific logic MUST NOT live here
/// - Workers never touch each other; the store is the only shared state
/// - The controller drives workers only through the run state, the
///   write gate and a cancellation token
pub mod attachment;
pub mod runner;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::classifier::LinkClassifier;
use crate::config::CollectorConfig;
use crate::controller::state::RunState;
use crate::schema::{AccountId, AccountStatus, ChatId, MessageId};
use crate::store::LinkStore;
use crate::transport::adapter::TransportSession;

use runner::SessionWorker;

/// Tuning shared by every worker.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub scratch_dir: PathBuf,
    pub max_attachment_bytes: u64,
    pub max_decoded_bytes: u64,
    pub rate_limit_jitter: Duration,
}

impl CollectorSettings {
    pub fn from_config(cfg: &CollectorConfig) -> Self {
        Self {
            scratch_dir: cfg
                .scratch_dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("link-collector")),
            max_attachment_bytes: cfg.max_attachment_bytes,
            max_decoded_bytes: cfg.max_decoded_bytes,
            rate_limit_jitter: Duration::from_millis(cfg.rate_limit_jitter_ms),
        }
    }

    /// `wait` plus a random extra delay of at most `rate_limit_jitter`.
    pub fn jittered(&self, wait: Duration) -> Duration {
        let jitter_ms = self.rate_limit_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return wait;
        }
        wait.saturating_add(Duration::from_millis(rand::random_range(0..=jitter_ms)))
    }
}

// ------------------------------------------------------------
// Per-account health and progress
// ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionHealth {
    /// Known account, no listener attached
    Idle,
    Listening,
    RateLimited { until: DateTime<Utc> },
    Lost { reason: String },
    /// Listener ended on request (pause is not a detach)
    Detached,
}

/// What `CollectionStatus` reports for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountReport {
    pub health: SessionHealth,
    /// Links this account inserted during the current run
    pub inserted: u64,
    pub duplicates: u64,
    pub discarded: u64,
    pub failures: u64,
    /// All links ever credited to this account
    pub stored: u64,
}

impl Default for AccountReport {
    fn default() -> Self {
        Self {
            health: SessionHealth::Idle,
            inserted: 0,
            duplicates: 0,
            discarded: 0,
            failures: 0,
            stored: 0,
        }
    }
}

#[derive(Default)]
struct AccountProgress {
    report: AccountReport,
    cursors: HashMap<ChatId, MessageId>,
    in_run: bool,
}

/// Per-account reports and per-chat cursors.
///
/// Cursors live for the whole process, across runs, so a session that
/// is reconnected never re-processes a message it already handled.
#[derive(Default)]
pub struct SessionTracker {
    inner: Mutex<BTreeMap<AccountId, AccountProgress>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<AccountId, AccountProgress>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resets run counters and makes `accounts` the reported set.
    /// Cursors of every account survive.
    pub fn begin_run(&self, accounts: &[AccountId]) {
        let mut inner = self.lock();
        for progress in inner.values_mut() {
            progress.in_run = false;
        }
        for id in accounts {
            let progress = inner.entry(*id).or_default();
            progress.report = AccountReport::default();
            progress.in_run = true;
        }
    }

    pub fn set_health(&self, account: AccountId, health: SessionHealth) {
        self.lock().entry(account).or_default().report.health = health;
    }

    pub fn record(&self, account: AccountId, update: impl FnOnce(&mut AccountReport)) {
        update(&mut self.lock().entry(account).or_default().report);
    }

    /// True when `message` is newer than anything processed in `chat`.
    pub fn is_new(&self, account: AccountId, chat: ChatId, message: MessageId) -> bool {
        self.lock()
            .get(&account)
            .and_then(|p| p.cursors.get(&chat))
            .is_none_or(|cursor| message > *cursor)
    }

    /// Moves the chat cursor forward. Never moves it back.
    pub fn advance(&self, account: AccountId, chat: ChatId, message: MessageId) {
        let mut inner = self.lock();
        let cursor = inner
            .entry(account)
            .or_default()
            .cursors
            .entry(chat)
            .or_insert(message);
        *cursor = (*cursor).max(message);
    }

    pub fn snapshot(&self) -> BTreeMap<AccountId, AccountReport> {
        self.lock()
            .iter()
            .filter(|(_, p)| p.in_run)
            .map(|(id, p)| (*id, p.report.clone()))
            .collect()
    }

    pub fn run_inserted(&self) -> u64 {
        self.lock()
            .values()
            .filter(|p| p.in_run)
            .map(|p| p.report.inserted)
            .sum()
    }
}

// ------------------------------------------------------------
// Worker → controller reports
// ------------------------------------------------------------

/// Session-level events that need the pool or the store to react.
#[derive(Debug, Clone)]
pub enum SessionReport {
    RateLimited { account: AccountId, wait: Duration },
    Recovered { account: AccountId },
    Lost { account: AccountId, reason: String, status: AccountStatus },
}

// ------------------------------------------------------------
// Collector
// ------------------------------------------------------------

pub(crate) struct WorkerContext {
    pub(crate) classifier: Arc<LinkClassifier>,
    pub(crate) store: Arc<LinkStore>,
    pub(crate) tracker: Arc<SessionTracker>,
    pub(crate) settings: CollectorSettings,
    pub(crate) state: watch::Receiver<RunState>,
    /// Held shared by a worker from its run-state check until the write
    /// commits; taken exclusively by the controller to change state.
    pub(crate) write_gate: Arc<RwLock<()>>,
}

/// Spawns and wires session workers.
#[derive(Clone)]
pub struct Collector {
    ctx: Arc<WorkerContext>,
}

impl Collector {
    pub fn new(
        classifier: Arc<LinkClassifier>,
        store: Arc<LinkStore>,
        tracker: Arc<SessionTracker>,
        settings: CollectorSettings,
        state: watch::Receiver<RunState>,
        write_gate: Arc<RwLock<()>>,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                classifier,
                store,
                tracker,
                settings,
                state,
                write_gate,
            }),
        }
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.ctx.settings
    }

    /// Starts listening on one session.
    ///
    /// The worker runs until `cancel` fires or the session is lost.
    /// Session-level problems are sent on `reports`.
    pub fn attach(
        &self,
        account: AccountId,
        session: Arc<dyn TransportSession>,
        cancel: CancellationToken,
        reports: mpsc::UnboundedSender<SessionReport>,
    ) -> SubscriptionHandle {
        let worker = SessionWorker::new(self.ctx.clone(), account, session, cancel, reports);
        SubscriptionHandle {
            account,
            handle: tokio::spawn(worker.run()),
        }
    }
}

/// Handle on one running worker.
pub struct SubscriptionHandle {
    pub account: AccountId,
    handle: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    /// Waits for the worker to end. Panics inside it are logged.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                log::error!("worker for account {} panicked", self.account);
            }
        }
    }
}
