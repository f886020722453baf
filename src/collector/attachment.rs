use std::io::{Cursor, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use rusqlite::{Connection, OpenFlags};
use tokio_util::sync::CancellationToken;

use crate::error::CollectorError;
use crate::schema::Attachment;
use crate::transport::adapter::TransportSession;
use crate::util::{self, AttachmentKind};

use super::CollectorSettings;

/// Archives with more members than this are read only up to it.
const MAX_ARCHIVE_MEMBERS: usize = 1000;

/// Downloads a scannable attachment and returns its decoded content.
///
/// FLOW:
/// - Reject by type / declared size before touching the network
/// - Download into a named scratch file (removed when dropped, on every
///   path out of this function)
/// - Decode: plain text as lossy UTF-8, gzip inflated, text members of
///   zip / tar archives read in memory, text columns of SQLite tables
///   joined line by line
///
/// Decoded output never exceeds `max_decoded_bytes`. Cancellation aborts
/// the download and fails the scan.
pub(crate) async fn scan(
    session: &dyn TransportSession,
    attachment: &Attachment,
    settings: &CollectorSettings,
    cancel: &CancellationToken,
) -> Result<String, CollectorError> {
    let kind = util::attachment_kind(
        attachment.file_name.as_deref(),
        attachment.mime_type.as_deref(),
    );
    if kind == AttachmentKind::Unsupported {
        return Err(CollectorError::AttachmentUnreadable(format!(
            "unsupported type ({})",
            attachment.mime_type.as_deref().unwrap_or("unknown")
        )));
    }
    if let Some(size) = attachment.size {
        if size > settings.max_attachment_bytes {
            return Err(CollectorError::AttachmentUnreadable(format!(
                "{size} bytes exceeds the {} byte limit",
                settings.max_attachment_bytes
            )));
        }
    }

    tokio::fs::create_dir_all(&settings.scratch_dir).await?;
    let stem = util::sanitize_file_name(
        attachment.file_name.as_deref().unwrap_or(&attachment.file_id),
    );
    let scratch = tempfile::Builder::new()
        .prefix(&format!("{stem}."))
        .suffix(".part")
        .tempfile_in(&settings.scratch_dir)?;

    tokio::select! {
        _ = cancel.cancelled() => {
            return Err(CollectorError::AttachmentUnreadable("download cancelled".into()));
        }
        downloaded = session.download_attachment(attachment, scratch.path(), settings.max_attachment_bytes) => {
            let bytes = downloaded?;
            log::debug!("downloaded {bytes} bytes for {stem}");
        }
    }

    let path = scratch.path().to_path_buf();
    let max_decoded = settings.max_decoded_bytes;
    let decoded = tokio::task::spawn_blocking(move || decode(kind, &path, max_decoded))
        .await
        .map_err(|e| CollectorError::AttachmentUnreadable(format!("decoder task failed: {e}")))??;

    drop(scratch);
    Ok(decoded)
}

fn unreadable(what: &str, e: impl std::fmt::Display) -> CollectorError {
    CollectorError::AttachmentUnreadable(format!("bad {what} data: {e}"))
}

fn decode(kind: AttachmentKind, path: &Path, max_decoded: u64) -> Result<String, CollectorError> {
    match kind {
        AttachmentKind::Text => {
            let mut raw = Vec::new();
            std::fs::File::open(path)?
                .take(max_decoded)
                .read_to_end(&mut raw)?;
            Ok(String::from_utf8_lossy(&raw).into_owned())
        }
        AttachmentKind::Gzip => {
            let mut inflated = Vec::new();
            GzDecoder::new(std::fs::File::open(path)?)
                .take(max_decoded)
                .read_to_end(&mut inflated)
                .map_err(|e| unreadable("gzip", e))?;
            Ok(String::from_utf8_lossy(&inflated).into_owned())
        }
        AttachmentKind::Zip => read_zip(&std::fs::read(path)?, max_decoded),
        AttachmentKind::Tar => read_tar(std::fs::File::open(path)?, max_decoded),
        AttachmentKind::TarGz => {
            read_tar(GzDecoder::new(std::fs::File::open(path)?), max_decoded)
        }
        AttachmentKind::Sqlite => read_sqlite(path, max_decoded),
        AttachmentKind::Unsupported => Err(CollectorError::AttachmentUnreadable(
            "unsupported type".into(),
        )),
    }
}

/// Accumulates decoded text up to a byte budget.
struct Budget {
    out: String,
    left: u64,
}

impl Budget {
    fn new(max: u64) -> Self {
        Self {
            out: String::new(),
            left: max,
        }
    }

    fn exhausted(&self) -> bool {
        self.left == 0
    }

    /// Reads at most the remaining budget from `member`.
    fn read(&mut self, member: impl Read) -> std::io::Result<()> {
        let mut raw = Vec::new();
        member.take(self.left).read_to_end(&mut raw)?;
        self.push(&String::from_utf8_lossy(&raw));
        Ok(())
    }

    fn push(&mut self, text: &str) {
        let mut take = text.len().min(self.left as usize);
        while !text.is_char_boundary(take) {
            take -= 1;
        }
        self.out.push_str(&text[..take]);
        self.out.push('\n');
        self.left -= take as u64;
    }
}

/// Members are scanned only when their own name says they are text.
/// Nested archives are not opened.
fn is_text_member(name: &str) -> bool {
    util::attachment_kind(Some(name), None) == AttachmentKind::Text
}

fn read_zip(raw: &[u8], max_decoded: u64) -> Result<String, CollectorError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(raw)).map_err(|e| unreadable("zip", e))?;
    let mut budget = Budget::new(max_decoded);

    for i in 0..archive.len().min(MAX_ARCHIVE_MEMBERS) {
        if budget.exhausted() {
            break;
        }
        let member = archive.by_index(i).map_err(|e| unreadable("zip", e))?;
        if member.is_dir() || !is_text_member(member.name()) {
            continue;
        }
        budget.read(member).map_err(|e| unreadable("zip", e))?;
    }
    Ok(budget.out)
}

fn read_tar(reader: impl Read, max_decoded: u64) -> Result<String, CollectorError> {
    let mut archive = tar::Archive::new(reader);
    let mut budget = Budget::new(max_decoded);

    let entries = archive.entries().map_err(|e| unreadable("tar", e))?;
    for entry in entries.take(MAX_ARCHIVE_MEMBERS) {
        if budget.exhausted() {
            break;
        }
        let entry = entry.map_err(|e| unreadable("tar", e))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let wanted = entry
            .path()
            .ok()
            .and_then(|p| p.to_str().map(is_text_member))
            .unwrap_or(false);
        if wanted {
            budget.read(entry).map_err(|e| unreadable("tar", e))?;
        }
    }
    Ok(budget.out)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Dumps every text value of every table, one per line.
fn read_sqlite(path: &Path, max_decoded: u64) -> Result<String, CollectorError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| unreadable("sqlite", e))?;

    let tables: Vec<String> = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
        .and_then(|mut stmt| {
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>();
            names
        })
        .map_err(|e| unreadable("sqlite", e))?;

    let mut budget = Budget::new(max_decoded);
    for table in tables {
        let columns: Vec<String> = conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(&table)))
            .and_then(|mut stmt| {
                let names = stmt
                    .query_map([], |row| row.get(1))?
                    .collect::<rusqlite::Result<Vec<String>>>();
                names
            })
            .map_err(|e| unreadable("sqlite", e))?;

        for column in columns {
            if budget.exhausted() {
                return Ok(budget.out);
            }
            let col = quote_ident(&column);
            let sql = format!(
                "SELECT {col} FROM {} WHERE typeof({col}) = 'text'",
                quote_ident(&table)
            );
            let mut stmt = conn.prepare(&sql).map_err(|e| unreadable("sqlite", e))?;
            let mut rows = stmt.query([]).map_err(|e| unreadable("sqlite", e))?;
            while let Some(row) = rows.next().map_err(|e| unreadable("sqlite", e))? {
                let value: String = row.get(0).map_err(|e| unreadable("sqlite", e))?;
                budget.push(&value);
                if budget.exhausted() {
                    break;
                }
            }
        }
    }
    Ok(budget.out)
}
