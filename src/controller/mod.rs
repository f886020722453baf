//! Collection controller
//!
//! The single control surface of the collector: start / pause / resume /
//! stop and status. Every command returns a `CollectionStatus`, never an
//! error. Failures are visible as per-account health and `last_error`.

pub mod state;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::classifier::LinkClassifier;
use crate::collector::{
    AccountReport, Collector, CollectorSettings, SessionHealth, SessionReport, SessionTracker,
    SubscriptionHandle,
};
use crate::error::CollectorError;
use crate::pool::SessionPool;
use crate::schema::{AccountId, AccountStatus};
use crate::store::{LinkStore, RunId};
use crate::util;

pub use state::{Command, RunState, Transition};

/// Snapshot returned by every control command.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatus {
    pub state: RunState,
    pub accounts: BTreeMap<AccountId, AccountReport>,
    /// Links in the store, all runs included
    pub total_links: u64,
    /// Links inserted by the current (or last) run
    pub run_links: u64,
    pub run_started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

type Subscriptions = Arc<Mutex<Vec<SubscriptionHandle>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bookkeeping for the run in progress.
struct ActiveRun {
    run_id: Option<RunId>,
    cancel: CancellationToken,
    /// Workers attached at start, plus those attached after a back-off
    subscriptions: Subscriptions,
    /// Accounts waiting out a connect-time back-off
    rejoins: Vec<JoinHandle<()>>,
    supervisor: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    last_error: Option<String>,
    run_started_at: Option<DateTime<Utc>>,
}

/// CollectionController
///
/// DESIGN:
/// - The run state lives in a `watch` channel. Workers read it before
///   every event and every write, so pause takes effect without
///   touching the workers.
/// - State changes take the write gate exclusively. Workers hold it
///   shared across "check state, write link", so once `pause` / `stop`
///   return nothing more is persisted.
/// - `start` / `stop` attach and detach workers; the pool keeps the
///   sessions themselves.
/// - Commands are serialized through `active`; `status` never waits
///   for a command in progress.
///
pub struct CollectionController {
    pool: Arc<SessionPool>,
    store: Arc<LinkStore>,
    collector: Collector,
    tracker: Arc<SessionTracker>,
    state: watch::Sender<RunState>,
    write_gate: Arc<RwLock<()>>,
    active: tokio::sync::Mutex<Option<ActiveRun>>,
    shared: Arc<Mutex<Shared>>,
    shutdown_timeout: Duration,
}

impl CollectionController {
    pub fn new(
        pool: Arc<SessionPool>,
        store: Arc<LinkStore>,
        classifier: Arc<LinkClassifier>,
        settings: CollectorSettings,
        shutdown_timeout: Duration,
    ) -> Self {
        let (state, state_rx) = watch::channel(RunState::Idle);
        let tracker = Arc::new(SessionTracker::new());
        let write_gate = Arc::new(RwLock::new(()));
        let collector = Collector::new(
            classifier,
            store.clone(),
            tracker.clone(),
            settings,
            state_rx,
            write_gate.clone(),
        );

        Self {
            pool,
            store,
            collector,
            tracker,
            state,
            write_gate,
            active: tokio::sync::Mutex::new(None),
            shared: Arc::new(Mutex::new(Shared::default())),
            shutdown_timeout,
        }
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    // ==================== Commands ====================

    /// Connects every registered account and attaches one worker per
    /// connected session.
    ///
    /// Accounts the platform rate-limits while connecting are retried
    /// once their back-off ends and join the run then. No-op unless
    /// idle or stopped. Stays idle, with `last_error` set, when no
    /// session is connected or waiting on a back-off.
    pub async fn start(&self) -> CollectionStatus {
        let mut active = self.active.lock().await;

        let current = self.state();
        let Transition::Move { to, .. } = state::apply(current, Command::Start) else {
            log::info!("start ignored: collection is {current:?}");
            return self.status().await;
        };
        if current == RunState::Stopped {
            self.state.send_replace(RunState::Idle);
        }

        let outcomes = match self.pool.connect_all().await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                self.fail(format!("cannot read accounts: {e}"));
                return self.status().await;
            }
        };

        let ids: Vec<AccountId> = outcomes.iter().map(|o| o.account).collect();
        self.tracker.begin_run(&ids);
        let mut waiting = Vec::new();
        for outcome in &outcomes {
            match &outcome.result {
                Ok(()) => {}
                Err(CollectorError::RateLimited { wait }) => {
                    let wait = self.collector.settings().jittered(*wait);
                    self.tracker.set_health(
                        outcome.account,
                        SessionHealth::RateLimited {
                            until: util::deadline_after(wait),
                        },
                    );
                    waiting.push((outcome.account, wait));
                }
                Err(other) => self.tracker.set_health(
                    outcome.account,
                    SessionHealth::Lost {
                        reason: other.to_string(),
                    },
                ),
            }
        }

        let sessions = self.pool.connected_sessions();
        if sessions.is_empty() && waiting.is_empty() {
            self.fail(if ids.is_empty() {
                "no accounts registered".to_string()
            } else {
                "no session could be connected".to_string()
            });
            return self.status().await;
        }

        let run_id = match self.store.start_run() {
            Ok(id) => Some(id),
            Err(e) => {
                log::warn!("could not record run start: {e}");
                None
            }
        };
        {
            let mut shared = self.shared();
            shared.last_error = None;
            shared.run_started_at = Some(util::now());
        }

        self.state.send_replace(to);

        let cancel = CancellationToken::new();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let attached: Vec<SubscriptionHandle> = sessions
            .into_iter()
            .map(|(account, session)| {
                self.collector
                    .attach(account, session, cancel.clone(), reports_tx.clone())
            })
            .collect();
        let members = attached.len() + waiting.len();
        let subscriptions: Subscriptions = Arc::new(Mutex::new(attached));

        let rejoin = Rejoin {
            pool: self.pool.clone(),
            collector: self.collector.clone(),
            tracker: self.tracker.clone(),
            cancel: cancel.clone(),
            reports: reports_tx,
            subscriptions: subscriptions.clone(),
        };
        let rejoins: Vec<JoinHandle<()>> = waiting
            .into_iter()
            .map(|(account, wait)| tokio::spawn(rejoin.clone().after(account, wait)))
            .collect();
        drop(rejoin);

        let supervisor = tokio::spawn(supervise(
            reports_rx,
            self.pool.clone(),
            self.store.clone(),
            self.shared.clone(),
            members,
        ));

        log::info!("collection running with {members} session(s)");
        *active = Some(ActiveRun {
            run_id,
            cancel,
            subscriptions,
            rejoins,
            supervisor,
        });

        self.status().await
    }

    /// Stops persisting new links. Sessions stay connected and events
    /// arriving meanwhile are dropped, not buffered.
    ///
    /// Returns once writes already in progress have finished.
    pub async fn pause(&self) -> CollectionStatus {
        let _active = self.active.lock().await;
        {
            let _writes = self.write_gate.write().await;
            self.transition(Command::Pause);
        }
        self.status().await
    }

    pub async fn resume(&self) -> CollectionStatus {
        let _active = self.active.lock().await;
        self.transition(Command::Resume);
        self.status().await
    }

    /// Detaches every worker and closes every session.
    ///
    /// The state flips to stopped before anything else, once writes in
    /// progress are done (bounded by the shutdown timeout). Workers still
    /// running after the timeout are aborted.
    pub async fn stop(&self) -> CollectionStatus {
        let mut active = self.active.lock().await;
        let moved = {
            let writes = timeout(self.shutdown_timeout, self.write_gate.write()).await;
            if writes.is_err() {
                log::warn!(
                    "writes still in progress after {:?}, stopping anyway",
                    self.shutdown_timeout
                );
            }
            self.transition(Command::Stop)
        };
        if moved.is_none() {
            return self.status().await;
        }

        if let Some(run) = active.take() {
            self.finish(run).await;
        }
        self.pool.disconnect_all().await;
        self.shared().run_started_at = None;

        self.status().await
    }

    /// Re-validates every registered account.
    /// Returns, per account, whether its credential is currently valid.
    pub async fn test_all_sessions(&self) -> BTreeMap<AccountId, bool> {
        match self.pool.test_all().await {
            Ok(results) => results
                .into_iter()
                .map(|(id, status)| (id, status == AccountStatus::Valid))
                .collect(),
            Err(e) => {
                log::error!("session test failed: {e}");
                self.shared().last_error = Some(format!("session test failed: {e}"));
                BTreeMap::new()
            }
        }
    }

    /// Full status, store counts included. The store is read on the
    /// blocking pool.
    pub async fn status(&self) -> CollectionStatus {
        let store = self.store.clone();
        let counts = tokio::task::spawn_blocking(move || {
            (store.link_counts_by_account(), store.count_links(None))
        })
        .await;

        let mut accounts = self.tracker.snapshot();
        let mut total_links = 0;
        match counts {
            Ok((per_account, total)) => {
                match per_account {
                    Ok(stored) => {
                        for (id, report) in accounts.iter_mut() {
                            report.stored = stored.get(id).copied().unwrap_or(0);
                        }
                    }
                    Err(e) => log::warn!("could not read per-account counts: {e}"),
                }
                match total {
                    Ok(total) => total_links = total,
                    Err(e) => log::warn!("could not count links: {e}"),
                }
            }
            Err(e) => log::warn!("store count task failed: {e}"),
        }

        let shared = self.shared();
        CollectionStatus {
            state: self.state(),
            accounts,
            total_links,
            run_links: self.tracker.run_inserted(),
            run_started_at: shared.run_started_at,
            last_error: shared.last_error.clone(),
        }
    }

    /// Per-account reports of the current run, without store counts.
    pub fn reports(&self) -> BTreeMap<AccountId, AccountReport> {
        self.tracker.snapshot()
    }

    // ==================== Internals ====================

    fn transition(&self, command: Command) -> Option<RunState> {
        let current = self.state();
        match state::apply(current, command) {
            Transition::Move { from, to } => {
                self.state.send_replace(to);
                log::info!("collection {from:?} -> {to:?}");
                Some(to)
            }
            Transition::Stay(state) => {
                log::info!("{command:?} ignored: collection is {state:?}");
                None
            }
        }
    }

    fn fail(&self, message: String) {
        log::error!("{message}");
        self.shared().last_error = Some(message);
    }

    async fn finish(&self, run: ActiveRun) {
        run.cancel.cancel();

        // Pending rejoins only sleep or connect; the pool closes
        // whatever they managed to open.
        for rejoin in &run.rejoins {
            rejoin.abort();
        }
        join_all(run.rejoins).await;

        let subscriptions = std::mem::take(&mut *lock(&run.subscriptions));
        let aborts: Vec<_> = subscriptions.iter().map(|s| s.abort_handle()).collect();
        let joined = timeout(
            self.shutdown_timeout,
            join_all(subscriptions.into_iter().map(SubscriptionHandle::join)),
        )
        .await;
        if joined.is_err() {
            log::warn!(
                "workers still busy after {:?}, aborting them",
                self.shutdown_timeout
            );
            for handle in aborts {
                handle.abort();
            }
        }
        run.supervisor.abort();

        if let Some(run_id) = run.run_id {
            if let Err(e) = self
                .store
                .finish_run(run_id, "stopped", self.tracker.run_inserted())
            {
                log::warn!("could not record run end: {e}");
            }
        }
    }
}

/// Brings an account that was rate-limited at connect time into the
/// running collection once its back-off is over.
#[derive(Clone)]
struct Rejoin {
    pool: Arc<SessionPool>,
    collector: Collector,
    tracker: Arc<SessionTracker>,
    cancel: CancellationToken,
    reports: mpsc::UnboundedSender<SessionReport>,
    subscriptions: Subscriptions,
}

impl Rejoin {
    async fn after(self, account: AccountId, mut wait: Duration) {
        loop {
            log::warn!(
                "account {account} rate limited while connecting, retrying in {:.1}s",
                wait.as_secs_f64()
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(wait) => {}
            }

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return,
                connected = self.pool.reconnect(account) => connected,
            };

            match connected {
                Ok(session) => {
                    let handle = self.collector.attach(
                        account,
                        session,
                        self.cancel.clone(),
                        self.reports.clone(),
                    );
                    lock(&self.subscriptions).push(handle);
                    let _ = self.reports.send(SessionReport::Recovered { account });
                    log::info!("account {account} joined the collection after its back-off");
                    return;
                }
                Err(CollectorError::RateLimited { wait: next }) => {
                    wait = self.collector.settings().jittered(next);
                    self.tracker.set_health(
                        account,
                        SessionHealth::RateLimited {
                            until: util::deadline_after(wait),
                        },
                    );
                }
                Err(e) => {
                    log::error!("account {account} could not rejoin: {e}");
                    let reason = e.to_string();
                    self.tracker.set_health(
                        account,
                        SessionHealth::Lost {
                            reason: reason.clone(),
                        },
                    );
                    let _ = self.reports.send(SessionReport::Lost {
                        account,
                        reason,
                        status: AccountStatus::from_error(&e),
                    });
                    return;
                }
            }
        }
    }
}

/// Reacts to worker reports for the duration of one run.
///
/// Lost sessions are released from the pool; account statuses follow
/// rate limits and recoveries. When every session of the run is lost
/// the run is effectively dead and `last_error` says so.
async fn supervise(
    mut reports: mpsc::UnboundedReceiver<SessionReport>,
    pool: Arc<SessionPool>,
    store: Arc<LinkStore>,
    shared: Arc<Mutex<Shared>>,
    sessions: usize,
) {
    let mut lost = 0;

    while let Some(report) = reports.recv().await {
        let (account, status) = match report {
            SessionReport::RateLimited { account, .. } => (account, AccountStatus::FloodLimited),
            SessionReport::Recovered { account } => (account, AccountStatus::Valid),
            SessionReport::Lost {
                account, status, ..
            } => {
                pool.release(account).await;
                lost += 1;
                if lost == sessions {
                    let message = "all sessions lost; restart the collection".to_string();
                    log::error!("{message}");
                    lock(&shared).last_error = Some(message);
                }
                (account, status)
            }
        };

        let store = store.clone();
        let written =
            tokio::task::spawn_blocking(move || store.set_account_status(account, status)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("could not record status for account {account}: {e}"),
            Err(e) => log::warn!("status task for account {account} failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::config::ClassifierConfig;
    use crate::schema::{Attachment, InboundMessage, MessageBody};
    use crate::transport::memory::{LoginBehavior, MemoryTransport};

    struct Harness {
        controller: CollectionController,
        transport: MemoryTransport,
        store: Arc<LinkStore>,
        ids: Vec<AccountId>,
        _scratch: tempfile::TempDir,
    }

    async fn harness(credentials: &[&str]) -> Harness {
        let transport = MemoryTransport::new();
        for cred in credentials {
            transport.add_account(cred, cred);
        }

        let store = Arc::new(LinkStore::open_in_memory().unwrap());
        let pool = Arc::new(SessionPool::new(
            Arc::new(transport.clone()),
            store.clone(),
            Duration::from_secs(2),
            Duration::from_secs(2),
        ));
        let mut ids = Vec::new();
        for cred in credentials {
            ids.push(pool.register(cred).await.unwrap());
        }

        let scratch = tempfile::tempdir().unwrap();
        let settings = CollectorSettings {
            scratch_dir: scratch.path().to_path_buf(),
            max_attachment_bytes: 1 << 20,
            max_decoded_bytes: 1 << 20,
            rate_limit_jitter: Duration::ZERO,
        };
        let classifier = Arc::new(LinkClassifier::new(&ClassifierConfig::default()).unwrap());
        let controller = CollectionController::new(
            pool,
            store.clone(),
            classifier,
            settings,
            Duration::from_secs(2),
        );

        Harness {
            controller,
            transport,
            store,
            ids,
            _scratch: scratch,
        }
    }

    fn text(id: i64, body: &str) -> InboundMessage {
        InboundMessage {
            id,
            chat_id: -100,
            sent_at: Utc::now(),
            body: MessageBody::Text { text: body.into() },
            button_urls: Vec::new(),
        }
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn links(h: &Harness) -> u64 {
        h.store.count_links(None).unwrap()
    }

    #[tokio::test]
    async fn same_link_on_two_sessions_is_stored_once() {
        let h = harness(&["a", "b"]).await;
        let status = h.controller.start().await;
        assert_eq!(status.state, RunState::Running);
        assert_eq!(status.accounts.len(), 2);

        let msg = text(1, "join https://t.me/joinchat/AAAAA1 now");
        assert!(h.transport.push_message("a", msg.clone()));
        assert!(h.transport.push_message("b", msg));

        eventually("both sessions to handle the message", || {
            h.controller
                .reports()
                .values()
                .map(|r| r.inserted + r.duplicates)
                .sum::<u64>()
                == 2
        })
        .await;

        assert_eq!(links(&h), 1);
        let status = h.controller.status().await;
        assert_eq!(status.run_links, 1);
        assert_eq!(status.total_links, 1);

        h.controller.stop().await;
    }

    #[tokio::test]
    async fn paused_collection_persists_nothing() {
        let h = harness(&["a"]).await;
        let a = h.ids[0];
        h.controller.start().await;

        h.transport
            .push_message("a", text(1, "https://t.me/joinchat/AAAAA1"));
        eventually("first link", || links(&h) == 1).await;

        let status = h.controller.pause().await;
        assert_eq!(status.state, RunState::Paused);

        h.transport
            .push_message("a", text(2, "https://t.me/joinchat/BBBBB2"));
        eventually("the paused event to be discarded", || {
            h.controller.reports()[&a].discarded == 1
        })
        .await;
        assert_eq!(links(&h), 1);
        assert!(h.transport.is_connected("a"));

        let status = h.controller.resume().await;
        assert_eq!(status.state, RunState::Running);

        h.transport
            .push_message("a", text(3, "https://chat.whatsapp.com/AbCdEfGhIjK1"));
        eventually("link after resume", || links(&h) == 2).await;
        assert!(!h.store.link_exists("https://t.me/joinchat/BBBBB2").unwrap());

        h.controller.stop().await;
    }

    #[tokio::test]
    async fn rate_limited_session_does_not_block_others() {
        let h = harness(&["a", "b"]).await;
        let (a, b) = (h.ids[0], h.ids[1]);
        h.controller.start().await;

        h.transport.push_flood_wait("a", Duration::from_secs(600));
        eventually("account a to back off", || {
            matches!(
                h.controller.reports()[&a].health,
                SessionHealth::RateLimited { .. }
            )
        })
        .await;

        h.transport
            .push_message("a", text(1, "https://t.me/joinchat/AAAAA1"));
        h.transport
            .push_message("b", text(1, "https://t.me/joinchat/BBBBB2"));
        eventually("account b to keep collecting", || {
            h.controller.reports()[&b].inserted == 1
        })
        .await;
        assert_eq!(links(&h), 1);

        // Back-off is cancellable: stop does not wait out the 600s.
        let started = Instant::now();
        let status = h.controller.stop().await;
        assert_eq!(status.state, RunState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn start_while_running_is_a_no_op() {
        let h = harness(&["a"]).await;
        h.controller.start().await;
        let status = h.controller.start().await;

        assert_eq!(status.state, RunState::Running);
        // One connect from registration, one from the first start.
        assert_eq!(h.transport.connect_count("a"), 2);

        assert_eq!(h.controller.pause().await.state, RunState::Paused);
        assert_eq!(h.controller.pause().await.state, RunState::Paused);
        assert_eq!(h.controller.start().await.state, RunState::Paused);

        h.controller.stop().await;
        assert_eq!(h.controller.stop().await.state, RunState::Stopped);
    }

    #[tokio::test]
    async fn no_connectable_session_stays_idle_with_error() {
        let h = harness(&["a"]).await;
        let a = h.ids[0];
        h.transport.set_login_behavior("a", LoginBehavior::Reject);

        let status = h.controller.start().await;
        assert_eq!(status.state, RunState::Idle);
        assert!(status.last_error.is_some());
        assert!(matches!(
            status.accounts[&a].health,
            SessionHealth::Lost { .. }
        ));

        let stored = h.store.get_sessions().unwrap();
        assert_eq!(stored[0].status, AccountStatus::Invalid);

        // Fixing the credential makes the next start succeed.
        h.transport.set_login_behavior("a", LoginBehavior::Accept);
        let status = h.controller.start().await;
        assert_eq!(status.state, RunState::Running);
        assert!(status.last_error.is_none());
        h.controller.stop().await;
    }

    #[tokio::test]
    async fn lost_session_is_isolated_and_released() {
        let h = harness(&["a", "b"]).await;
        let (a, b) = (h.ids[0], h.ids[1]);
        h.controller.start().await;

        h.transport.drop_connection("a");
        eventually("account a to be marked lost", || {
            matches!(
                h.controller.reports()[&a].health,
                SessionHealth::Lost { .. }
            )
        })
        .await;
        eventually("account a to leave the pool", || {
            !h.controller.pool().is_connected(a)
        })
        .await;

        h.transport
            .push_message("b", text(9, "https://t.me/joinchat/BBBBB2"));
        eventually("account b to keep collecting", || {
            h.controller.reports()[&b].inserted == 1
        })
        .await;
        assert_eq!(h.controller.state(), RunState::Running);
        assert!(h.controller.status().await.last_error.is_none());

        h.controller.stop().await;
    }

    #[tokio::test]
    async fn links_from_caption_buttons_and_attachment_are_collected() {
        let h = harness(&["a"]).await;
        h.controller.start().await;

        h.transport.put_file(
            "f1",
            b"dump:\nhttps://chat.whatsapp.com/AbCdEfGhIjK1\nt.me/+CCCCC3".to_vec(),
        );
        let msg = InboundMessage {
            id: 1,
            chat_id: -7,
            sent_at: Utc::now(),
            body: MessageBody::Attachment {
                caption: Some("see https://t.me/joinchat/AAAAA1".into()),
                attachment: Attachment {
                    file_id: "f1".into(),
                    file_name: Some("links.txt".into()),
                    mime_type: Some("text/plain".into()),
                    size: Some(64),
                },
            },
            button_urls: vec!["https://t.me/joinchat/BBBBB2".into()],
        };
        h.transport.push_message("a", msg);

        eventually("all four links", || links(&h) == 4).await;
        h.controller.stop().await;
    }

    #[tokio::test]
    async fn stop_is_bounded_with_a_stalled_download() {
        let h = harness(&["a"]).await;
        h.controller.start().await;

        h.transport.put_stalled_file("slow");
        let msg = InboundMessage {
            id: 1,
            chat_id: -7,
            sent_at: Utc::now(),
            body: MessageBody::Attachment {
                caption: None,
                attachment: Attachment {
                    file_id: "slow".into(),
                    file_name: Some("slow.txt".into()),
                    mime_type: None,
                    size: None,
                },
            },
            button_urls: Vec::new(),
        };
        h.transport.push_message("a", msg);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let status = h.controller.stop().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(status.state, RunState::Stopped);
        assert!(!h.transport.is_connected("a"));
    }

    #[tokio::test]
    async fn restart_after_stop_skips_already_processed_messages() {
        let h = harness(&["a"]).await;
        let a = h.ids[0];
        h.controller.start().await;
        h.transport
            .push_message("a", text(5, "https://t.me/joinchat/AAAAA1"));
        eventually("first link", || links(&h) == 1).await;
        h.controller.stop().await;

        let status = h.controller.start().await;
        assert_eq!(status.state, RunState::Running);
        assert_eq!(status.run_links, 0);

        // Replayed message: cursor says it was handled already.
        h.transport
            .push_message("a", text(5, "https://t.me/joinchat/ZZZZZ9"));
        h.transport
            .push_message("a", text(6, "https://t.me/joinchat/BBBBB2"));
        eventually("the newer message", || {
            h.controller.reports()[&a].inserted == 1
        })
        .await;
        assert!(!h.store.link_exists("https://t.me/joinchat/ZZZZZ9").unwrap());

        h.controller.stop().await;
    }

    #[tokio::test]
    async fn test_all_sessions_reports_validity() {
        let h = harness(&["a", "b"]).await;
        let (a, b) = (h.ids[0], h.ids[1]);
        h.transport.set_login_behavior("b", LoginBehavior::Reject);

        let results = h.controller.test_all_sessions().await;
        assert!(results[&a]);
        assert!(!results[&b]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pause_waits_for_a_write_in_flight() {
        let h = harness(&["a"]).await;
        h.controller.start().await;

        // Hold the store so the worker's next write blocks mid-flight.
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let store = h.store.clone();
        let holder = std::thread::spawn(move || {
            let _conn = store.conn();
            locked_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        locked_rx.recv().unwrap();

        h.transport
            .push_message("a", text(1, "https://t.me/joinchat/AAAAA1"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let release = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            release_tx.send(()).unwrap();
        };
        let (status, ()) = tokio::join!(h.controller.pause(), release);
        holder.join().unwrap();
        assert_eq!(status.state, RunState::Paused);

        // The in-flight write landed before pause returned, nothing after.
        let at_pause = links(&h);
        assert_eq!(at_pause, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(links(&h), at_pause);

        h.controller.stop().await;
    }

    #[tokio::test]
    async fn huge_connect_back_off_does_not_break_start() {
        let h = harness(&["a"]).await;
        let a = h.ids[0];
        h.transport.set_login_behavior(
            "a",
            LoginBehavior::FloodWait(Duration::from_secs(100_000_000_000_000)),
        );

        let status = h.controller.start().await;
        assert_eq!(status.state, RunState::Running);
        assert!(matches!(
            status.accounts[&a].health,
            SessionHealth::RateLimited { until } if until > Utc::now()
        ));

        let started = Instant::now();
        assert_eq!(h.controller.stop().await.state, RunState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn account_rate_limited_at_connect_joins_after_its_back_off() {
        let h = harness(&["a", "b"]).await;
        let (a, b) = (h.ids[0], h.ids[1]);
        h.transport
            .set_login_behavior("b", LoginBehavior::FloodWait(Duration::from_millis(200)));

        let status = h.controller.start().await;
        assert_eq!(status.state, RunState::Running);
        assert!(h.controller.pool().is_connected(a));
        assert!(matches!(
            status.accounts[&b].health,
            SessionHealth::RateLimited { .. }
        ));
        h.transport.set_login_behavior("b", LoginBehavior::Accept);

        eventually("account b to reconnect", || h.controller.pool().is_connected(b)).await;
        eventually("account b to listen", || {
            h.controller.reports()[&b].health == SessionHealth::Listening
        })
        .await;

        h.transport
            .push_message("b", text(1, "https://t.me/joinchat/BBBBB2"));
        eventually("account b to collect", || {
            h.controller.reports()[&b].inserted == 1
        })
        .await;
        eventually("account b to be valid again", || {
            h.store
                .get_sessions()
                .unwrap()
                .iter()
                .any(|acc| acc.id == b && acc.status == AccountStatus::Valid)
        })
        .await;

        h.controller.stop().await;
        assert!(!h.transport.is_connected("b"));
    }
}
