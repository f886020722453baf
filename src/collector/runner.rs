use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::classifier::ClassifiedLink;
use crate::error::CollectorError;
use crate::metrics::{bump, METRICS};
use crate::schema::{AccountId, AccountStatus, InboundMessage};
use crate::store::SaveOutcome;
use crate::transport::adapter::TransportSession;
use crate::util;

use super::{attachment, SessionHealth, SessionReport, WorkerContext};

/// Why a worker loop ended.
enum Exit {
    Cancelled,
    Lost(CollectorError),
}

/// Listener for exactly one session.
///
/// This loop:
/// - Waits for the session's next event (or cancellation)
/// - Discards events while the collection is not running
/// - Extracts, classifies and persists links one event at a time
/// - Backs off on platform rate limits without touching other sessions
///
/// GUARANTEES:
/// - Events of one session are handled in arrival order
/// - Per-event failures never end the loop
/// - Cancellation is observed between events and during downloads and
///   back-offs
///
/// NOT RESPONSIBLE FOR:
/// - Reconnecting (a lost session is reported and the worker exits)
/// - Closing the session (the pool owns it)
///
pub(crate) struct SessionWorker {
    ctx: Arc<WorkerContext>,
    account: AccountId,
    session: Arc<dyn TransportSession>,
    cancel: CancellationToken,
    reports: mpsc::UnboundedSender<SessionReport>,
}

impl SessionWorker {
    pub(crate) fn new(
        ctx: Arc<WorkerContext>,
        account: AccountId,
        session: Arc<dyn TransportSession>,
        cancel: CancellationToken,
        reports: mpsc::UnboundedSender<SessionReport>,
    ) -> Self {
        Self {
            ctx,
            account,
            session,
            cancel,
            reports,
        }
    }

    pub(crate) async fn run(self) {
        METRICS.listeners_active.fetch_add(1, Ordering::Relaxed);
        self.ctx
            .tracker
            .set_health(self.account, SessionHealth::Listening);
        log::info!("account {} listening", self.account);

        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                next = self.session.next_event() => Some(next),
            };
            let Some(next) = next else {
                break Exit::Cancelled;
            };

            let result = match next {
                Ok(Some(message)) => self.handle(message).await,
                Ok(None) => {
                    break Exit::Lost(CollectorError::TransportLost("event stream ended".into()));
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {}
                Err(CollectorError::RateLimited { wait }) => {
                    if !self.back_off(wait).await {
                        break Exit::Cancelled;
                    }
                }
                Err(e) if e.is_session_fatal() => break Exit::Lost(e),
                Err(e) => {
                    log::warn!("account {}: {e}", self.account);
                    self.ctx.tracker.record(self.account, |r| r.failures += 1);
                }
            }
        };

        METRICS.listeners_active.fetch_sub(1, Ordering::Relaxed);

        match exit {
            Exit::Cancelled => {
                self.ctx
                    .tracker
                    .set_health(self.account, SessionHealth::Detached);
                log::info!("account {} detached", self.account);
            }
            Exit::Lost(e) if self.cancel.is_cancelled() => {
                // Stream closed by shutdown, not by the platform.
                log::debug!("account {} ended during shutdown: {e}", self.account);
                self.ctx
                    .tracker
                    .set_health(self.account, SessionHealth::Detached);
            }
            Exit::Lost(e) => {
                bump(&METRICS.transport_losses);
                log::error!("account {} lost: {e}", self.account);
                let reason = e.to_string();
                self.ctx.tracker.set_health(
                    self.account,
                    SessionHealth::Lost {
                        reason: reason.clone(),
                    },
                );
                let _ = self.reports.send(SessionReport::Lost {
                    account: self.account,
                    reason,
                    status: AccountStatus::from_error(&e),
                });
            }
        }
    }

    fn running(&self) -> bool {
        self.ctx.state.borrow().accepts_events()
    }

    /// Processes one event end to end.
    ///
    /// A rate limit hit while downloading the attachment does not lose
    /// the links already found in the text; it is returned after they
    /// are written so the loop can back off.
    async fn handle(&self, message: InboundMessage) -> Result<(), CollectorError> {
        bump(&METRICS.events_received);

        if !self.running() {
            bump(&METRICS.events_discarded);
            self.ctx.tracker.record(self.account, |r| r.discarded += 1);
            return Ok(());
        }
        if !self
            .ctx
            .tracker
            .is_new(self.account, message.chat_id, message.id)
        {
            log::debug!(
                "account {}: message {} in {} already processed",
                self.account,
                message.id,
                message.chat_id
            );
            return Ok(());
        }

        let classifier = &self.ctx.classifier;
        let mut links = Vec::new();
        if let Some(text) = message.text() {
            links.extend(classifier.classify(text));
        }
        links.extend(
            message
                .button_urls
                .iter()
                .filter_map(|url| classifier.classify_url(url)),
        );

        let mut deferred = None;
        if let Some(file) = message.attachment() {
            let scanned =
                attachment::scan(self.session.as_ref(), file, &self.ctx.settings, &self.cancel)
                    .await;
            match scanned {
                Ok(content) => {
                    bump(&METRICS.attachments_scanned);
                    links.extend(classifier.classify(&content));
                }
                Err(e) if e.is_session_fatal() || matches!(e, CollectorError::RateLimited { .. }) => {
                    deferred = Some(e);
                }
                Err(e) => {
                    bump(&METRICS.attachment_errors);
                    self.ctx.tracker.record(self.account, |r| r.failures += 1);
                    log::warn!(
                        "account {}: skipping attachment {}: {e}",
                        self.account,
                        file.file_name.as_deref().unwrap_or(&file.file_id)
                    );
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        links.retain(|l| seen.insert(l.normalized.clone()));
        self.persist(&message, links).await;

        self.ctx
            .tracker
            .advance(self.account, message.chat_id, message.id);

        deferred.map_or(Ok(()), Err)
    }

    /// Writes links one record at a time. Stops as soon as the
    /// collection leaves the running state.
    ///
    /// The write gate is held from the state check until the write
    /// returns, so a state change waits for it and no link commits
    /// after `pause` / `stop` have returned.
    async fn persist(&self, message: &InboundMessage, links: Vec<ClassifiedLink>) {
        for link in links {
            let _gate = self.ctx.write_gate.read().await;
            if !self.running() {
                log::debug!(
                    "account {}: collection paused mid-message, dropping remaining links",
                    self.account
                );
                break;
            }
            bump(&METRICS.links_extracted);

            let record = link.into_record(self.account, message.chat_id, util::now());
            let url = record.normalized_url.clone();
            let class = record.class;
            let store = self.ctx.store.clone();
            let saved = tokio::task::spawn_blocking(move || store.save_link(&record)).await;

            match saved {
                Ok(Ok(SaveOutcome::Inserted)) => {
                    bump(&METRICS.links_inserted);
                    self.ctx.tracker.record(self.account, |r| r.inserted += 1);
                    log::info!("account {} collected [{}] {url}", self.account, class.as_str());
                }
                Ok(Ok(SaveOutcome::AlreadyExists)) => {
                    bump(&METRICS.links_duplicate);
                    self.ctx.tracker.record(self.account, |r| r.duplicates += 1);
                }
                Ok(Err(e)) => {
                    bump(&METRICS.store_errors);
                    self.ctx.tracker.record(self.account, |r| r.failures += 1);
                    log::warn!("account {}: could not save {url}: {e}", self.account);
                }
                Err(e) => {
                    bump(&METRICS.store_errors);
                    self.ctx.tracker.record(self.account, |r| r.failures += 1);
                    log::error!("account {}: store task failed: {e}", self.account);
                }
            }
        }
    }

    /// Sleeps out a platform back-off plus jitter.
    /// Returns false if cancelled meanwhile.
    async fn back_off(&self, wait: Duration) -> bool {
        bump(&METRICS.rate_limits);

        let total = self.ctx.settings.jittered(wait);
        self.ctx.tracker.set_health(
            self.account,
            SessionHealth::RateLimited {
                until: util::deadline_after(total),
            },
        );
        let _ = self.reports.send(SessionReport::RateLimited {
            account: self.account,
            wait: total,
        });
        log::warn!(
            "account {} rate limited, pausing it for {:.1}s",
            self.account,
            total.as_secs_f64()
        );

        tokio::select! {
            _ = self.cancel.cancelled() => return false,
            _ = sleep(total) => {}
        }

        self.ctx
            .tracker
            .set_health(self.account, SessionHealth::Listening);
        let _ = self.reports.send(SessionReport::Recovered {
            account: self.account,
        });
        log::info!("account {} resumed after back-off", self.account);
        true
    }
}
