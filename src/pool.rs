use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::timeout;

use crate::error::CollectorError;
use crate::metrics::METRICS;
use crate::schema::{Account, AccountId, AccountStatus, Credential};
use crate::store::LinkStore;
use crate::transport::adapter::{MessagingTransport, TransportSession};

/// Result of one account's connection attempt in `connect_all`.
#[derive(Debug)]
pub struct ConnectOutcome {
    pub account: AccountId,
    pub result: Result<(), CollectorError>,
}

/// SessionPool
///
/// Owns every live platform session, keyed by account.
///
/// DESIGN:
/// - Accounts live in the store; the pool only holds connections.
/// - Every per-account operation is isolated: one account failing to
///   connect, validate or disconnect never affects another.
/// - Attempts run concurrently and are individually time-bounded.
///
/// OWNERSHIP:
/// - The pool is the only place that calls `disconnect`.
/// - Collector workers borrow sessions through `connected_sessions`.
///
pub struct SessionPool {
    transport: Arc<dyn MessagingTransport>,
    store: Arc<LinkStore>,
    connect_timeout: Duration,
    shutdown_timeout: Duration,
    sessions: Mutex<BTreeMap<AccountId, Arc<dyn TransportSession>>>,
}

impl SessionPool {
    pub fn new(
        transport: Arc<dyn MessagingTransport>,
        store: Arc<LinkStore>,
        connect_timeout: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            store,
            connect_timeout,
            shutdown_timeout,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, BTreeMap<AccountId, Arc<dyn TransportSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validates a session string against the platform and stores it.
    ///
    /// Registering an already-known credential refreshes its identity
    /// and status and returns the existing id. Nothing is stored when
    /// validation fails.
    pub async fn register(&self, raw: &str) -> Result<AccountId, CollectorError> {
        let credential = Credential::parse(raw)?;
        let session = self.open(&credential).await?;
        let identity = session.identity().clone();
        session.disconnect().await;

        let id = self
            .store
            .add_account(&credential, &identity, AccountStatus::Valid)?;
        log::info!(
            "registered account {id} ({})",
            identity.username.as_deref().unwrap_or("no username")
        );
        Ok(id)
    }

    /// Soft-removes an account, closing its session first if connected.
    pub async fn remove(&self, account: AccountId) -> Result<bool, CollectorError> {
        self.release(account).await;
        let removed = self.store.remove_account(account)?;
        if removed {
            log::info!("removed account {account}");
        }
        Ok(removed)
    }

    /// Connects every registered account that is not already connected.
    ///
    /// Returns one outcome per account. Statuses are written back to the
    /// store as attempts complete. Only a failure to read the account
    /// list is returned as an error.
    pub async fn connect_all(&self) -> Result<Vec<ConnectOutcome>, CollectorError> {
        let accounts = self.store.get_sessions()?;
        let already: HashSet<AccountId> = self.sessions().keys().copied().collect();

        let attempts = accounts.into_iter().map(|account| {
            let skip = already.contains(&account.id);
            async move {
                if skip {
                    return ConnectOutcome {
                        account: account.id,
                        result: Ok(()),
                    };
                }
                let result = self.connect_one(&account).await;
                ConnectOutcome {
                    account: account.id,
                    result,
                }
            }
        });

        Ok(join_all(attempts).await)
    }

    /// Connects one registered account and returns its live session.
    ///
    /// Used to bring an account back after a platform back-off. The
    /// status is written back like in `connect_all`.
    pub async fn reconnect(
        &self,
        account: AccountId,
    ) -> Result<Arc<dyn TransportSession>, CollectorError> {
        let Some(known) = self
            .store
            .get_sessions()?
            .into_iter()
            .find(|a| a.id == account)
        else {
            return Err(CollectorError::UnknownAccount(account));
        };

        self.connect_one(&known).await?;
        self.sessions().get(&account).cloned().ok_or_else(|| {
            CollectorError::TransportLost(format!("account {account} released while connecting"))
        })
    }

    async fn connect_one(&self, account: &Account) -> Result<(), CollectorError> {
        let result = self.open(&account.credential).await;
        self.write_status(
            account.id,
            match &result {
                Ok(_) => AccountStatus::Valid,
                Err(e) => AccountStatus::from_error(e),
            },
        );

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                log::warn!("account {} failed to connect: {e}", account.id);
                return Err(e);
            }
        };

        let replaced = self.sessions().insert(account.id, session);
        match replaced {
            Some(old) => old.disconnect().await,
            None => {
                METRICS.sessions_connected.fetch_add(1, Ordering::Relaxed);
            }
        }
        log::info!(
            "account {} connected as {}",
            account.id,
            account.identity.username.as_deref().unwrap_or("?")
        );
        Ok(())
    }

    /// Re-validates every registered account and records the result.
    ///
    /// Connected accounts are checked over their live session; the
    /// others get a short-lived connection that is closed afterwards.
    pub async fn test_all(&self) -> Result<BTreeMap<AccountId, AccountStatus>, CollectorError> {
        let accounts = self.store.get_sessions()?;
        let live = self.sessions().clone();

        let checks = accounts.into_iter().map(|account| {
            let session = live.get(&account.id).cloned();
            async move {
                let result = match session {
                    Some(session) => self.bounded(session.validate()).await.map(|_| ()),
                    None => match self.open(&account.credential).await {
                        Ok(session) => {
                            let checked = self.bounded(session.validate()).await.map(|_| ());
                            session.disconnect().await;
                            checked
                        }
                        Err(e) => Err(e),
                    },
                };

                let status = match &result {
                    Ok(()) => AccountStatus::Valid,
                    Err(e) => {
                        log::warn!("account {} failed validation: {e}", account.id);
                        AccountStatus::from_error(e)
                    }
                };
                self.write_status(account.id, status);
                (account.id, status)
            }
        });

        Ok(join_all(checks).await.into_iter().collect())
    }

    /// Closes every live session. Idempotent and bounded by the
    /// shutdown timeout; sessions still closing after it are abandoned.
    pub async fn disconnect_all(&self) {
        let drained = std::mem::take(&mut *self.sessions());
        if drained.is_empty() {
            return;
        }

        let count = drained.len();
        let closing = drained.into_iter().map(|(account, session)| async move {
            session.disconnect().await;
            log::info!("account {account} disconnected");
        });

        if timeout(self.shutdown_timeout, join_all(closing)).await.is_err() {
            log::warn!(
                "sessions still closing after {:?}, abandoning them",
                self.shutdown_timeout
            );
        }
        METRICS.sessions_connected.fetch_sub(count, Ordering::Relaxed);
    }

    /// Drops one account's session (if any) after it was lost or removed.
    pub async fn release(&self, account: AccountId) {
        let session = self.sessions().remove(&account);
        if let Some(session) = session {
            session.disconnect().await;
            METRICS.sessions_connected.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn accounts(&self) -> Result<Vec<Account>, CollectorError> {
        self.store.get_sessions()
    }

    pub fn connected_sessions(&self) -> Vec<(AccountId, Arc<dyn TransportSession>)> {
        self.sessions()
            .iter()
            .map(|(id, session)| (*id, session.clone()))
            .collect()
    }

    pub fn is_connected(&self, account: AccountId) -> bool {
        self.sessions().contains_key(&account)
    }

    async fn open(&self, credential: &Credential) -> Result<Arc<dyn TransportSession>, CollectorError> {
        self.bounded(self.transport.connect(credential)).await
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, CollectorError>>,
    ) -> Result<T, CollectorError> {
        match timeout(self.connect_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CollectorError::TransportLost(format!(
                "{} did not answer within {:?}",
                self.transport.name(),
                self.connect_timeout
            ))),
        }
    }

    fn write_status(&self, account: AccountId, status: AccountStatus) {
        if let Err(e) = self.store.set_account_status(account, status) {
            log::warn!("could not record status for account {account}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{LoginBehavior, MemoryTransport};

    fn pool_with(transport: &MemoryTransport) -> (SessionPool, Arc<LinkStore>) {
        let store = Arc::new(LinkStore::open_in_memory().unwrap());
        let pool = SessionPool::new(
            Arc::new(transport.clone()),
            store.clone(),
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        (pool, store)
    }

    #[tokio::test]
    async fn register_validates_before_storing() {
        let transport = MemoryTransport::new();
        transport.add_account("good", "good_user");
        let (pool, store) = pool_with(&transport);

        let id = pool.register("  good  ").await.unwrap();
        assert!(matches!(
            pool.register("unknown").await,
            Err(CollectorError::AuthInvalid(_))
        ));
        assert!(matches!(
            pool.register("  ").await,
            Err(CollectorError::AuthInvalid(_))
        ));

        let accounts = store.get_sessions().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, id);
        assert_eq!(accounts[0].status, AccountStatus::Valid);
        assert_eq!(accounts[0].identity.username.as_deref(), Some("good_user"));

        // Validation sessions are not kept open.
        assert!(!transport.is_connected("good"));
        assert_eq!(pool.register("good").await.unwrap(), id);
    }

    #[tokio::test]
    async fn connect_all_isolates_failures() {
        let transport = MemoryTransport::new();
        transport.add_account("a", "a");
        transport.add_account("b", "b");
        transport.add_account("c", "c");
        let (pool, store) = pool_with(&transport);

        let a = pool.register("a").await.unwrap();
        let b = pool.register("b").await.unwrap();
        let c = pool.register("c").await.unwrap();

        transport.set_login_behavior("b", LoginBehavior::Reject);
        transport.set_login_behavior("c", LoginBehavior::FloodWait(Duration::from_secs(30)));

        let outcomes = pool.connect_all().await.unwrap();
        assert_eq!(outcomes.len(), 3);
        let by_id: BTreeMap<_, _> = outcomes.into_iter().map(|o| (o.account, o.result)).collect();
        assert!(by_id[&a].is_ok());
        assert!(matches!(by_id[&b], Err(CollectorError::AuthInvalid(_))));
        assert!(matches!(by_id[&c], Err(CollectorError::RateLimited { .. })));

        assert!(pool.is_connected(a));
        assert!(!pool.is_connected(b));
        assert_eq!(pool.connected_sessions().len(), 1);

        let statuses: BTreeMap<_, _> = store
            .get_sessions()
            .unwrap()
            .into_iter()
            .map(|acc| (acc.id, acc.status))
            .collect();
        assert_eq!(statuses[&b], AccountStatus::Invalid);
        assert_eq!(statuses[&c], AccountStatus::FloodLimited);

        // Already connected accounts are not reconnected.
        pool.connect_all().await.unwrap();
        assert_eq!(transport.connect_count("a"), 2);

        pool.disconnect_all().await;
        pool.disconnect_all().await;
        assert!(!transport.is_connected("a"));
        assert!(pool.connected_sessions().is_empty());
    }

    #[tokio::test]
    async fn reconnect_brings_back_one_account() {
        let transport = MemoryTransport::new();
        transport.add_account("a", "a");
        let (pool, store) = pool_with(&transport);
        let a = pool.register("a").await.unwrap();

        transport.set_login_behavior("a", LoginBehavior::FloodWait(Duration::from_secs(5)));
        assert!(matches!(
            pool.reconnect(a).await,
            Err(CollectorError::RateLimited { .. })
        ));
        assert!(!pool.is_connected(a));

        transport.set_login_behavior("a", LoginBehavior::Accept);
        let session = pool.reconnect(a).await.unwrap();
        assert_eq!(session.identity().username.as_deref(), Some("a"));
        assert!(pool.is_connected(a));
        assert_eq!(store.get_sessions().unwrap()[0].status, AccountStatus::Valid);

        assert!(matches!(
            pool.reconnect(AccountId(99)).await,
            Err(CollectorError::UnknownAccount(AccountId(99)))
        ));
        pool.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_all_reports_every_account() {
        let transport = MemoryTransport::new();
        transport.add_account("ok", "ok");
        transport.add_account("revoked", "revoked");
        let (pool, _store) = pool_with(&transport);

        let ok = pool.register("ok").await.unwrap();
        let revoked = pool.register("revoked").await.unwrap();
        pool.connect_all().await.unwrap();

        transport.set_login_behavior("revoked", LoginBehavior::Reject);
        let results = pool.test_all().await.unwrap();
        assert_eq!(results[&ok], AccountStatus::Valid);
        assert_eq!(results[&revoked], AccountStatus::Invalid);

        assert!(pool.remove(revoked).await.unwrap());
        assert!(!pool.is_connected(revoked));
        assert_eq!(pool.test_all().await.unwrap().len(), 1);
    }
}
