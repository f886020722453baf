use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::CollectorError;
use crate::schema::{AccountIdentity, Attachment, Credential, InboundMessage};

use super::adapter::{MessagingTransport, TransportSession};

/// How a scripted account answers a login / validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginBehavior {
    Accept,
    Reject,
    FloodWait(Duration),
}

/// What a scripted file download does.
#[derive(Debug, Clone)]
enum ScriptedFile {
    Bytes(Vec<u8>),
    /// Never completes. Used to exercise cancellation of in-flight work.
    Stall,
}

#[derive(Debug)]
enum Scripted {
    Message(InboundMessage),
    FloodWait(Duration),
    Drop,
}

struct ScriptedAccount {
    identity: AccountIdentity,
    behavior: LoginBehavior,
    live: Option<(u64, mpsc::UnboundedSender<Scripted>)>,
    connects: usize,
}

#[derive(Default)]
struct Inner {
    accounts: Mutex<HashMap<String, ScriptedAccount>>,
    files: Mutex<HashMap<String, ScriptedFile>>,
    generation: std::sync::atomic::AtomicU64,
}

impl Inner {
    fn accounts(&self) -> MutexGuard<'_, HashMap<String, ScriptedAccount>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn files(&self) -> MutexGuard<'_, HashMap<String, ScriptedFile>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn login_check(&self, credential: &str) -> Result<AccountIdentity, CollectorError> {
        let accounts = self.accounts();
        let Some(account) = accounts.get(credential) else {
            return Err(CollectorError::AuthInvalid("unknown session".into()));
        };
        match &account.behavior {
            LoginBehavior::Accept => Ok(account.identity.clone()),
            LoginBehavior::Reject => Err(CollectorError::AuthInvalid("session revoked".into())),
            LoginBehavior::FloodWait(wait) => Err(CollectorError::RateLimited { wait: *wait }),
        }
    }
}

/// In-process transport driven by a script.
///
/// Each registered credential behaves like one platform account:
/// messages pushed for it are delivered to its live session, in order.
/// Used by the test suites; downstream crates get it through the
/// `test-utils` feature.
///
/// Cloning is cheap; clones share the same script.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an account that accepts logins.
    pub fn add_account(&self, credential: &str, username: &str) {
        let identity = AccountIdentity {
            user_id: Some(self.inner.accounts().len() as i64 + 1),
            username: Some(username.to_string()),
            phone: None,
        };
        self.inner.accounts().insert(
            credential.to_string(),
            ScriptedAccount {
                identity,
                behavior: LoginBehavior::Accept,
                live: None,
                connects: 0,
            },
        );
    }

    pub fn set_login_behavior(&self, credential: &str, behavior: LoginBehavior) {
        if let Some(account) = self.inner.accounts().get_mut(credential) {
            account.behavior = behavior;
        }
    }

    /// Delivers a message to the account's live session.
    /// Returns false when the account has no live session.
    pub fn push_message(&self, credential: &str, message: InboundMessage) -> bool {
        self.push(credential, Scripted::Message(message))
    }

    /// Makes the live session report a platform back-off.
    pub fn push_flood_wait(&self, credential: &str, wait: Duration) -> bool {
        self.push(credential, Scripted::FloodWait(wait))
    }

    /// Ends the live session's event stream as a lost connection would.
    pub fn drop_connection(&self, credential: &str) -> bool {
        self.push(credential, Scripted::Drop)
    }

    pub fn put_file(&self, file_id: &str, bytes: impl Into<Vec<u8>>) {
        self.inner
            .files()
            .insert(file_id.to_string(), ScriptedFile::Bytes(bytes.into()));
    }

    /// Registers a file whose download never finishes.
    pub fn put_stalled_file(&self, file_id: &str) {
        self.inner
            .files()
            .insert(file_id.to_string(), ScriptedFile::Stall);
    }

    pub fn is_connected(&self, credential: &str) -> bool {
        self.inner
            .accounts()
            .get(credential)
            .is_some_and(|a| a.live.is_some())
    }

    pub fn connect_count(&self, credential: &str) -> usize {
        self.inner
            .accounts()
            .get(credential)
            .map_or(0, |a| a.connects)
    }

    fn push(&self, credential: &str, item: Scripted) -> bool {
        self.inner
            .accounts()
            .get(credential)
            .and_then(|a| a.live.as_ref())
            .is_some_and(|(_, tx)| tx.send(item).is_ok())
    }
}

#[async_trait::async_trait]
impl MessagingTransport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Arc<dyn TransportSession>, CollectorError> {
        let identity = self.inner.login_check(credential.expose())?;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(account) = self.inner.accounts().get_mut(credential.expose()) {
            // A previous live session sees its stream end.
            account.live = Some((generation, tx));
            account.connects += 1;
        }

        Ok(Arc::new(MemorySession {
            credential: credential.expose().to_string(),
            generation,
            identity,
            inner: self.inner.clone(),
            events: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemorySession {
    credential: String,
    generation: u64,
    identity: AccountIdentity,
    inner: Arc<Inner>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<Scripted>>,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl TransportSession for MemorySession {
    fn identity(&self) -> &AccountIdentity {
        &self.identity
    }

    async fn validate(&self) -> Result<AccountIdentity, CollectorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CollectorError::TransportLost("session closed".into()));
        }
        self.inner.login_check(&self.credential)
    }

    async fn next_event(&self) -> Result<Option<InboundMessage>, CollectorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let next = self.events.lock().await.recv().await;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match next {
            Some(Scripted::Message(message)) => Ok(Some(message)),
            Some(Scripted::FloodWait(wait)) => Err(CollectorError::RateLimited { wait }),
            Some(Scripted::Drop) => Err(CollectorError::TransportLost("connection dropped".into())),
            None => Ok(None),
        }
    }

    async fn download_attachment(
        &self,
        attachment: &Attachment,
        dest: &Path,
        max_bytes: u64,
    ) -> Result<u64, CollectorError> {
        let file = self.inner.files().get(&attachment.file_id).cloned();
        match file {
            None => Err(CollectorError::AttachmentUnreadable(format!(
                "file {} not found",
                attachment.file_id
            ))),
            Some(ScriptedFile::Stall) => {
                std::future::pending::<()>().await;
                Ok(0)
            }
            Some(ScriptedFile::Bytes(bytes)) => {
                if bytes.len() as u64 > max_bytes {
                    return Err(CollectorError::AttachmentUnreadable(format!(
                        "attachment exceeds {max_bytes} bytes"
                    )));
                }
                tokio::fs::write(dest, &bytes).await?;
                Ok(bytes.len() as u64)
            }
        }
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut accounts = self.inner.accounts();
        if let Some(account) = accounts.get_mut(&self.credential) {
            // Only detach the channel if it is still ours.
            if account.live.as_ref().is_some_and(|(g, _)| *g == self.generation) {
                account.live = None;
            }
        }
    }
}
