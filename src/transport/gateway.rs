use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::config::TransportConfig;
use crate::error::CollectorError;
use crate::schema::{AccountIdentity, Attachment, Credential, InboundMessage};
use crate::util;

use super::adapter::{MessagingTransport, TransportSession};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

type EventItem = Result<InboundMessage, CollectorError>;
type ControlItem = Result<AccountIdentity, CollectorError>;

/// Messages buffered between the socket reader and the collector worker.
/// When full, the reader stops reading and the gateway sees backpressure.
const EVENT_BUFFER: usize = 1_024;

const VALIDATE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// Gateway error codes meaning the session string is no longer usable.
const AUTH_ERROR_CODES: [&str; 7] = [
    "AUTH_INVALID",
    "AUTH_KEY_INVALID",
    "AUTH_KEY_UNREGISTERED",
    "AUTH_KEY_DUPLICATED",
    "SESSION_REVOKED",
    "SESSION_EXPIRED",
    "USER_DEACTIVATED",
];

/// Frames sent by the gateway. Unknown `op`s are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Frame {
    Ready {
        #[serde(default)]
        user: AccountIdentity,
    },
    Me {
        #[serde(default)]
        user: AccountIdentity,
    },
    Error {
        code: String,
        #[serde(default)]
        message: Option<String>,
    },
    FloodWait {
        seconds: u64,
    },
    Message {
        message: InboundMessage,
    },
    Ping,
    #[serde(other)]
    Unknown,
}

/// Gateway WebSocket transport
///
/// Talks to a protocol bridge that owns the actual platform client
/// library. One WebSocket per account session.
///
/// WIRE FORMAT (JSON text frames):
/// - client → `login`, `get_me`, `pong`
/// - server → `ready`, `me`, `error`, `flood_wait`, `message`, `ping`
///
/// Attachments are fetched over plain HTTP from `files_url`, authorized
/// with the session string as bearer token.
pub struct GatewayTransport {
    cfg: TransportConfig,
    http: reqwest::Client,
    debug_raw: bool,
}

impl GatewayTransport {
    pub fn new(cfg: TransportConfig, debug_raw: bool) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
            debug_raw,
        }
    }
}

#[async_trait::async_trait]
impl MessagingTransport for GatewayTransport {

    fn name(&self) -> &'static str {
        "gateway"
    }

    /// Connects, performs the login handshake and spawns the reader.
    ///
    /// The handshake is read inline so login failures surface as the
    /// return value of `connect` instead of on the event stream.
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Arc<dyn TransportSession>, CollectorError> {
        let (ws, _) = connect_async(self.cfg.url.as_str()).await.map_err(lost)?;
        let (mut write, mut read) = ws.split();

        // ------------------------------------------------------------
        // LOGIN HANDSHAKE
        // ------------------------------------------------------------
        let login = json!({
            "op": "login",
            "time": util::now_ms(),
            "session": credential.expose(),
            "api_id": self.cfg.api_id,
            "api_hash": self.cfg.api_hash,
        });
        write
            .send(Message::Text(login.to_string().into()))
            .await
            .map_err(lost)?;

        let identity = await_ready(&mut read, self.debug_raw).await?;

        // ------------------------------------------------------------
        // READER TASK
        // ------------------------------------------------------------
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (control_tx, control_rx) = mpsc::channel(4);
        let writer = Arc::new(Mutex::new(write));

        let reader = tokio::spawn(read_loop(
            read,
            writer.clone(),
            event_tx,
            control_tx,
            self.debug_raw,
        ));

        Ok(Arc::new(GatewaySession {
            identity,
            credential: credential.clone(),
            files_url: self.cfg.files_url.trim_end_matches('/').to_string(),
            http: self.http.clone(),
            writer,
            events: Mutex::new(event_rx),
            control: Mutex::new(control_rx),
            reader: StdMutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One logged-in gateway connection.
struct GatewaySession {
    identity: AccountIdentity,
    credential: Credential,
    files_url: String,
    http: reqwest::Client,
    writer: Arc<Mutex<WsWriter>>,
    events: Mutex<mpsc::Receiver<EventItem>>,
    control: Mutex<mpsc::Receiver<ControlItem>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl GatewaySession {
    async fn send_json(&self, value: Value) -> Result<(), CollectorError> {
        self.writer
            .lock()
            .await
            .send(Message::Text(value.to_string().into()))
            .await
            .map_err(lost)
    }
}

#[async_trait::async_trait]
impl TransportSession for GatewaySession {
    fn identity(&self) -> &AccountIdentity {
        &self.identity
    }

    async fn validate(&self) -> Result<AccountIdentity, CollectorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CollectorError::TransportLost("session closed".into()));
        }

        let mut control = self.control.lock().await;
        // Answers to an earlier, timed-out request
        while control.try_recv().is_ok() {}

        self.send_json(json!({ "op": "get_me" })).await?;

        match timeout(VALIDATE_TIMEOUT, control.recv()).await {
            Ok(Some(answer)) => answer,
            Ok(None) => Err(CollectorError::TransportLost("gateway closed".into())),
            Err(_) => Err(CollectorError::TransportLost("validation timed out".into())),
        }
    }

    async fn next_event(&self) -> Result<Option<InboundMessage>, CollectorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match self.events.lock().await.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn download_attachment(
        &self,
        attachment: &Attachment,
        dest: &Path,
        max_bytes: u64,
    ) -> Result<u64, CollectorError> {
        let url = format!("{}/{}", self.files_url, attachment.file_id);
        let mut resp = self
            .http
            .get(&url)
            .bearer_auth(self.credential.expose())
            .send()
            .await
            .map_err(|e| CollectorError::AttachmentUnreadable(format!("download failed: {e}")))?;

        match resp.status() {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(CollectorError::AuthInvalid(format!(
                    "file download refused ({})",
                    resp.status()
                )));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let wait = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                return Err(CollectorError::RateLimited {
                    wait: Duration::from_secs(wait),
                });
            }
            s => {
                return Err(CollectorError::AttachmentUnreadable(format!(
                    "download failed with {s}"
                )));
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(dest)
            .await?;

        let mut written = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| CollectorError::AttachmentUnreadable(format!("download interrupted: {e}")))?
        {
            written += chunk.len() as u64;
            if written > max_bytes {
                return Err(CollectorError::AttachmentUnreadable(format!(
                    "attachment exceeds {max_bytes} bytes"
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(written)
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let close = async {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
            let _ = writer.close().await;
        };
        if timeout(CLOSE_TIMEOUT, close).await.is_err() {
            log::debug!("gateway close handshake timed out");
        }

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            handle.abort();
        }
    }
}

/// Reads frames until the gateway answers the login.
async fn await_ready(read: &mut WsReader, debug_raw: bool) -> Result<AccountIdentity, CollectorError> {
    while let Some(frame) = read.next().await {
        let text = match frame.map_err(lost)? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        if debug_raw {
            log::debug!("[gateway RECV] {text}");
        }

        match serde_json::from_str::<Frame>(text.as_str()) {
            Ok(Frame::Ready { user }) => return Ok(user),
            Ok(Frame::Error { code, message }) => {
                return Err(error_from_code(&code, message.as_deref()));
            }
            Ok(Frame::FloodWait { seconds }) => {
                return Err(CollectorError::RateLimited {
                    wait: Duration::from_secs(seconds),
                });
            }
            Ok(_) => {}
            Err(e) => log::debug!("ignoring malformed gateway frame: {e}"),
        }
    }
    Err(CollectorError::TransportLost("gateway closed during login".into()))
}

/// Routes gateway frames until the socket closes:
/// - messages and flood waits → event channel (worker)
/// - `me` answers and non-fatal errors → control channel (validate)
/// - pings are answered directly
///
/// Dropping the senders on exit is what ends the worker's stream.
async fn read_loop(
    mut read: WsReader,
    writer: Arc<Mutex<WsWriter>>,
    events: mpsc::Sender<EventItem>,
    control: mpsc::Sender<ControlItem>,
    debug_raw: bool,
) {
    while let Some(frame) = read.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                log::warn!("gateway read error: {e}");
                break;
            }
        };
        if debug_raw {
            log::debug!("[gateway RECV] {text}");
        }

        let frame = match serde_json::from_str::<Frame>(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("ignoring malformed gateway frame: {e}");
                continue;
            }
        };

        let keep_going = match frame {
            Frame::Message { message } => events.send(Ok(message)).await.is_ok(),
            Frame::FloodWait { seconds } => events
                .send(Err(CollectorError::RateLimited {
                    wait: Duration::from_secs(seconds),
                }))
                .await
                .is_ok(),
            Frame::Me { user } => {
                let _ = control.try_send(Ok(user));
                true
            }
            Frame::Error { code, message } => {
                let err = error_from_code(&code, message.as_deref());
                if err.is_session_fatal() {
                    let _ = control.try_send(Err(CollectorError::AuthInvalid(code)));
                    let _ = events.send(Err(err)).await;
                    false
                } else {
                    log::warn!("gateway error: {err}");
                    let _ = control.try_send(Err(err));
                    true
                }
            }
            Frame::Ping => writer
                .lock()
                .await
                .send(Message::Text(r#"{"op":"pong"}"#.into()))
                .await
                .is_ok(),
            Frame::Ready { .. } | Frame::Unknown => true,
        };

        if !keep_going {
            break;
        }
    }

    log::debug!("gateway reader ended");
}

fn error_from_code(code: &str, message: Option<&str>) -> CollectorError {
    let upper = code.to_ascii_uppercase();
    if AUTH_ERROR_CODES.iter().any(|c| upper.starts_with(c)) {
        CollectorError::AuthInvalid(code.to_string())
    } else {
        CollectorError::TransportLost(format!("{code}: {}", message.unwrap_or("no details")))
    }
}

fn lost(err: impl std::fmt::Display) -> CollectorError {
    CollectorError::TransportLost(err.to_string())
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;
    use crate::schema::MessageBody;

    fn transport_for(addr: std::net::SocketAddr) -> GatewayTransport {
        GatewayTransport::new(
            TransportConfig {
                kind: "gateway".into(),
                url: format!("ws://{addr}"),
                files_url: format!("http://{addr}/files"),
                api_id: 2040,
                api_hash: "hash".into(),
                connect_timeout_secs: 5,
            },
            false,
        )
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> Option<Value> {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).ok();
            }
        }
        None
    }

    #[test]
    fn frames_parse_and_unknown_ops_are_tolerated() {
        let frame: Frame = serde_json::from_str(r#"{"op":"flood_wait","seconds":42}"#).unwrap();
        assert!(matches!(frame, Frame::FloodWait { seconds: 42 }));

        let frame: Frame = serde_json::from_str(r#"{"op":"typing","chat_id":1}"#).unwrap();
        assert!(matches!(frame, Frame::Unknown));

        let frame: Frame = serde_json::from_str(
            r#"{"op":"message","message":{"id":1,"chat_id":-5,"body":{"kind":"text","text":"hi"}}}"#,
        )
        .unwrap();
        assert!(matches!(frame, Frame::Message { .. }));
    }

    #[test]
    fn auth_codes_map_to_auth_invalid() {
        assert!(matches!(
            error_from_code("AUTH_KEY_UNREGISTERED", None),
            CollectorError::AuthInvalid(_)
        ));
        assert!(matches!(
            error_from_code("session_revoked", Some("bye")),
            CollectorError::AuthInvalid(_)
        ));
        assert!(matches!(
            error_from_code("INTERNAL", Some("boom")),
            CollectorError::TransportLost(_)
        ));
    }

    #[tokio::test]
    async fn login_events_flood_wait_and_validation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let login = next_text(&mut ws).await.unwrap();
            assert_eq!(login["op"], "login");
            assert_eq!(login["session"], "good-session");

            let frames = [
                json!({"op": "ready", "user": {"user_id": 1, "username": "collector"}}),
                json!({"op": "message", "message": {
                    "id": 5, "chat_id": -100,
                    "body": {"kind": "text", "text": "https://t.me/joinchat/ABC123"}
                }}),
                json!({"op": "flood_wait", "seconds": 60}),
                json!({"op": "ping"}),
            ];
            for frame in frames {
                ws.send(Message::Text(frame.to_string().into())).await.unwrap();
            }

            let mut saw_pong = false;
            while let Some(frame) = next_text(&mut ws).await {
                match frame["op"].as_str() {
                    Some("pong") => saw_pong = true,
                    Some("get_me") => {
                        let me = json!({"op": "me", "user": {"user_id": 1, "username": "collector"}});
                        ws.send(Message::Text(me.to_string().into())).await.unwrap();
                    }
                    _ => {}
                }
            }
            saw_pong
        });

        let transport = transport_for(addr);
        let session = transport
            .connect(&Credential::parse("good-session").unwrap())
            .await
            .unwrap();
        assert_eq!(session.identity().username.as_deref(), Some("collector"));

        let message = session.next_event().await.unwrap().unwrap();
        assert_eq!(message.id, 5);
        assert!(matches!(message.body, MessageBody::Text { .. }));

        match session.next_event().await {
            Err(CollectorError::RateLimited { wait }) => assert_eq!(wait, Duration::from_secs(60)),
            other => panic!("expected rate limit, got {other:?}"),
        }

        let me = session.validate().await.unwrap();
        assert_eq!(me.user_id, Some(1));

        session.disconnect().await;
        session.disconnect().await;
        assert!(session.next_event().await.unwrap().is_none());
        assert!(server.await.unwrap(), "ping should have been answered");
    }

    #[tokio::test]
    async fn rejected_login_is_auth_invalid() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = next_text(&mut ws).await;
            let err = json!({"op": "error", "code": "AUTH_KEY_UNREGISTERED"});
            let _ = ws.send(Message::Text(err.to_string().into())).await;
        });

        let result = transport_for(addr)
            .connect(&Credential::parse("revoked").unwrap())
            .await;
        assert!(matches!(result, Err(CollectorError::AuthInvalid(_))));
    }
}
