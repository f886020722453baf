use std::path::Path;
use std::sync::Arc;

use crate::error::CollectorError;
use crate::schema::{AccountIdentity, Attachment, Credential, InboundMessage};

/// MessagingTransport is the abstraction layer between:
/// - The generic session pool / collector runtime
/// - A concrete way of reaching the messaging platform
///
/// Each transport implementation must:
/// - Turn a credential into an authenticated session
/// - Map platform failures onto the shared error taxonomy
///
/// DESIGN GOALS:
/// - Zero protocol-specific logic outside transports
/// - Sessions of one transport are fully independent of each other
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - One transport instance is shared by the whole pool
///
#[async_trait::async_trait]
pub trait MessagingTransport: Send + Sync {

    /// Returns the canonical transport name.
    ///
    /// CONTRACT:
    /// - Must match `transport.kind` in configuration
    ///
    fn name(&self) -> &'static str;

    /// Opens and authenticates one session.
    ///
    /// ERRORS:
    /// - `AuthInvalid`   credential rejected
    /// - `RateLimited`   platform-mandated back-off (carries the wait)
    /// - `TransportLost` anything network-level
    ///
    /// The returned handle is owned by the pool.
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Arc<dyn TransportSession>, CollectorError>;
}

/// One authenticated, long-lived platform session.
///
/// OWNERSHIP:
/// - The session pool owns every handle and is the only caller of
///   `disconnect`.
/// - Collector workers hold a clone of the `Arc` to read events and
///   download attachments. They never close it.
///
/// ORDERING:
/// - `next_event` yields the session's messages in arrival order.
///   It is only ever awaited by one worker at a time.
///
#[async_trait::async_trait]
pub trait TransportSession: Send + Sync {

    /// Identity reported by the platform during login.
    fn identity(&self) -> &AccountIdentity;

    /// Re-checks that the session is still authorized, without
    /// disturbing the event stream.
    async fn validate(&self) -> Result<AccountIdentity, CollectorError>;

    /// Waits for the next new message on any joined conversation.
    ///
    /// RETURNS:
    /// - `Ok(Some(msg))` next message
    /// - `Ok(None)`      the stream ended (connection closed)
    /// - `Err(RateLimited)` the platform asked this session to back off;
    ///   the stream stays usable afterwards
    /// - other errors: the session is unusable
    async fn next_event(&self) -> Result<Option<InboundMessage>, CollectorError>;

    /// Downloads an attachment into `dest` (an existing, empty file).
    ///
    /// Returns the number of bytes written. Must stop and fail once
    /// more than `max_bytes` would be written.
    async fn download_attachment(
        &self,
        attachment: &Attachment,
        dest: &Path,
        max_bytes: u64,
    ) -> Result<u64, CollectorError>;

    /// Releases every transport resource. Idempotent.
    async fn disconnect(&self);
}
