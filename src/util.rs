/// Utility helpers shared by the collector pipeline.
///
/// This module contains:
/// - Time helpers (including overflow-safe deadlines)
/// - Attachment type detection
/// - File name sanitizing for scratch files
///
/// IMPORTANT:
/// - No platform-specific or storage logic should live here.
/// - Everything here must remain deterministic and side-effect free.
///

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Current wall-clock time in UTC.
///
/// Used for discovery timestamps, validation timestamps and run
/// boundaries so they all share one clock.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    now().timestamp_millis()
}

/// Wall-clock instant `wait` from now.
///
/// Platform back-offs can be arbitrarily large; anything past the
/// representable range saturates to `DateTime::<Utc>::MAX_UTC`.
pub fn deadline_after(wait: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|d| now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// How an attachment's bytes should be turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    /// Decode directly (lossy UTF-8)
    Text,

    /// Inflate with gzip first, then decode
    Gzip,

    /// Text-like members of a zip archive
    Zip,

    /// Text-like members of a tar archive
    Tar,

    /// Text-like members of a gzip-compressed tar archive
    TarGz,

    /// Text columns of every table in an SQLite database
    Sqlite,

    /// Not scanned
    Unsupported,
}

const TEXT_EXTENSIONS: [&str; 28] = [
    "txt", "log", "csv", "json", "xml", "yaml", "yml", "html", "htm", "md", "rst", "ini", "cfg",
    "conf", "php", "js", "py", "java", "cpp", "c", "h", "cs", "sql", "sh", "bash", "ps1", "bat",
    "cmd",
];

const SQLITE_EXTENSIONS: [&str; 4] = ["sqlite", "sqlite3", "db", "db3"];

/// Decide how to read an attachment from its name and MIME type.
///
/// Examples:
/// - ("links.txt", None)                   -> Text
/// - ("dump.sql.gz", None)                 -> Gzip
/// - ("export.tar.gz", None)               -> TarGz
/// - ("chats.db", None)                    -> Sqlite
/// - ("notes", Some("text/plain"))         -> Text
/// - ("photo.jpg", Some("image/jpeg"))     -> Unsupported
///
pub fn attachment_kind(file_name: Option<&str>, mime_type: Option<&str>) -> AttachmentKind {
    let name = file_name.map(str::to_ascii_lowercase);
    let ext = name
        .as_deref()
        .and_then(|n| n.rsplit_once('.'))
        .map(|(_, ext)| ext);

    match ext {
        Some("tgz") => return AttachmentKind::TarGz,
        Some("gz") if name.as_deref().is_some_and(|n| n.ends_with(".tar.gz")) => {
            return AttachmentKind::TarGz;
        }
        Some("gz") => return AttachmentKind::Gzip,
        Some("tar") => return AttachmentKind::Tar,
        Some("zip") => return AttachmentKind::Zip,
        Some(ext) if SQLITE_EXTENSIONS.contains(&ext) => return AttachmentKind::Sqlite,
        Some(ext) if TEXT_EXTENSIONS.contains(&ext) => return AttachmentKind::Text,
        _ => {}
    }

    match mime_type.map(str::to_ascii_lowercase).as_deref() {
        Some("application/gzip" | "application/x-gzip") => AttachmentKind::Gzip,
        Some("application/zip" | "application/x-zip-compressed") => AttachmentKind::Zip,
        Some("application/x-tar") => AttachmentKind::Tar,
        Some("application/vnd.sqlite3" | "application/x-sqlite3") => AttachmentKind::Sqlite,
        Some(m) if m.starts_with("text/") => AttachmentKind::Text,
        Some("application/json" | "application/xml" | "application/sql") => AttachmentKind::Text,
        _ => AttachmentKind::Unsupported,
    }
}

/// Make a platform-provided file name safe to use as a scratch
/// file prefix. Anything outside `[A-Za-z0-9._-]` becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let out: String = name
        .chars()
        .take(64)
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();

    if out.trim_matches(['.', '_']).is_empty() {
        "attachment".to_string()
    } else {
        out
    }
}
