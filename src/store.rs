//! SQLite persistence for accounts, collected links and collection runs.
//!
//! The store is the only state shared by every collector worker. It
//! owns the dedup invariant: `links.url_normalized` is UNIQUE and every
//! insert is `INSERT OR IGNORE` inside its own transaction, so callers
//! never coordinate with each other.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;

use crate::error::{CollectorError, Result};
use crate::schema::{
    Account, AccountId, AccountIdentity, AccountStatus, Credential, LinkClass, LinkRecord,
};
use crate::util;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS accounts (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        credential    TEXT NOT NULL UNIQUE,
        status        TEXT NOT NULL DEFAULT 'unknown',
        validated_at  TEXT,
        user_id       INTEGER,
        username      TEXT,
        phone         TEXT,
        added_at      TEXT NOT NULL,
        removed_at    TEXT
    );

    CREATE TABLE IF NOT EXISTS links (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        url_normalized  TEXT NOT NULL UNIQUE,
        url_raw         TEXT NOT NULL,
        classification  TEXT NOT NULL,
        account_id      INTEGER NOT NULL REFERENCES accounts(id),
        chat_id         INTEGER NOT NULL,
        discovered_at   TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS collection_runs (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at       TEXT NOT NULL,
        ended_at         TEXT,
        status           TEXT NOT NULL,
        links_collected  INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_links_classification ON links(classification);
    CREATE INDEX IF NOT EXISTS idx_links_account ON links(account_id);
    CREATE INDEX IF NOT EXISTS idx_accounts_removed ON accounts(removed_at);
";

/// Result of `save_link`. `AlreadyExists` is the expected outcome for
/// any link another session (or an earlier message) already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    AlreadyExists,
}

/// Optional narrowing for counts, listings and exports.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkFilter {
    pub class: Option<LinkClass>,
    pub account: Option<AccountId>,
}

impl LinkFilter {
    pub fn class(class: LinkClass) -> Self {
        Self {
            class: Some(class),
            account: None,
        }
    }

    pub fn account(account: AccountId) -> Self {
        Self {
            class: None,
            account: Some(account),
        }
    }
}

/// A row of the `links` table.
#[derive(Debug, Clone, Serialize)]
pub struct StoredLink {
    pub id: i64,
    #[serde(flatten)]
    pub record: LinkRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct RunId(pub i64);

pub struct LinkStore {
    conn: Mutex<Connection>,
}

impl LinkStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        let store = Self::init(conn)?;
        log::info!("Link store opened at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// A panic while holding the lock cannot leave a half-applied
    /// statement behind (SQLite rolls back), so poisoning is ignored.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== Accounts ====================

    /// Insert an account, or refresh and revive the one already holding
    /// this credential. Returns its id either way.
    pub fn add_account(
        &self,
        credential: &Credential,
        identity: &AccountIdentity,
        status: AccountStatus,
    ) -> Result<AccountId> {
        let now = util::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO accounts (credential, status, validated_at, user_id, username, phone, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?3)
             ON CONFLICT(credential) DO UPDATE SET
                 status = excluded.status,
                 validated_at = excluded.validated_at,
                 user_id = excluded.user_id,
                 username = excluded.username,
                 phone = excluded.phone,
                 removed_at = NULL",
            params![
                credential.expose(),
                status.as_str(),
                now,
                identity.user_id,
                identity.username,
                identity.phone,
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM accounts WHERE credential = ?1",
            [credential.expose()],
            |row| row.get(0),
        )?;
        Ok(AccountId(id))
    }

    /// Soft-remove an account. Its links stay in place and keep a valid
    /// foreign key; the account is no longer returned by `get_sessions`
    /// and can no longer be credited with new links.
    pub fn remove_account(&self, id: AccountId) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE accounts SET removed_at = ?1 WHERE id = ?2 AND removed_at IS NULL",
            params![util::now().to_rfc3339(), id.0],
        )?;
        Ok(changed > 0)
    }

    /// Record the outcome of a connect / validation attempt.
    ///
    /// `validated_at` only moves when the platform actually gave an
    /// answer (anything but `Unknown`).
    pub fn set_account_status(&self, id: AccountId, status: AccountStatus) -> Result<()> {
        let validated_at = (status != AccountStatus::Unknown).then(|| util::now().to_rfc3339());
        self.conn().execute(
            "UPDATE accounts
             SET status = ?1, validated_at = COALESCE(?2, validated_at)
             WHERE id = ?3",
            params![status.as_str(), validated_at, id.0],
        )?;
        Ok(())
    }

    /// All registered (not removed) accounts, oldest first.
    pub fn get_sessions(&self) -> Result<Vec<Account>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, credential, status, validated_at, user_id, username, phone, added_at
             FROM accounts
             WHERE removed_at IS NULL
             ORDER BY id",
        )?;
        let accounts = stmt
            .query_map([], |row| {
                let credential: String = row.get(1)?;
                let status: String = row.get(2)?;
                Ok(Account {
                    id: AccountId(row.get(0)?),
                    credential: Credential::parse(&credential)
                        .map_err(|e| conversion_error(1, e))?,
                    status: status.parse().map_err(|e| conversion_error(2, e))?,
                    validated_at: optional_timestamp(row, 3)?,
                    identity: AccountIdentity {
                        user_id: row.get(4)?,
                        username: row.get(5)?,
                        phone: row.get(6)?,
                    },
                    added_at: timestamp(row, 7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    // ==================== Links ====================

    /// Persist one link, idempotently on its normalized URL.
    ///
    /// The account check and the insert share one IMMEDIATE transaction,
    /// so a record is either fully visible or not at all.
    pub fn save_link(&self, record: &LinkRecord) -> Result<SaveOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let registered: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM accounts WHERE id = ?1 AND removed_at IS NULL)",
            [record.account_id.0],
            |row| row.get(0),
        )?;
        if !registered {
            return Err(CollectorError::UnknownAccount(record.account_id));
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO links
                 (url_normalized, url_raw, classification, account_id, chat_id, discovered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.normalized_url,
                record.raw_url,
                record.class.as_str(),
                record.account_id.0,
                record.chat_id,
                record.discovered_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        Ok(if inserted > 0 {
            SaveOutcome::Inserted
        } else {
            SaveOutcome::AlreadyExists
        })
    }

    pub fn link_exists(&self, normalized_url: &str) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM links WHERE url_normalized = ?1",
                [normalized_url],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count_links(&self, filter: Option<&LinkFilter>) -> Result<u64> {
        let filter = filter.copied().unwrap_or_default();
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM links
             WHERE (?1 IS NULL OR classification = ?1)
               AND (?2 IS NULL OR account_id = ?2)",
            params![filter.class.map(LinkClass::as_str), filter.account.map(|a| a.0)],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub fn link_counts_by_account(&self) -> Result<BTreeMap<AccountId, u64>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT account_id, COUNT(*) FROM links GROUP BY account_id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((AccountId(row.get(0)?), row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .map(|(id, n)| (id, u64::try_from(n).unwrap_or_default()))
            .collect())
    }

    pub fn link_counts_by_class(&self) -> Result<BTreeMap<LinkClass, u64>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT classification, COUNT(*) FROM links GROUP BY classification")?;
        let rows = stmt
            .query_map([], |row| {
                let class: String = row.get(0)?;
                let class = class.parse::<LinkClass>().map_err(|e| conversion_error(0, e))?;
                Ok((class, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .map(|(class, n)| (class, u64::try_from(n).unwrap_or_default()))
            .collect())
    }

    /// Links in discovery order, optionally filtered and paged.
    pub fn list_links(
        &self,
        filter: Option<&LinkFilter>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredLink>> {
        let filter = filter.copied().unwrap_or_default();
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, url_raw, url_normalized, classification, account_id, chat_id, discovered_at
             FROM links
             WHERE (?1 IS NULL OR classification = ?1)
               AND (?2 IS NULL OR account_id = ?2)
             ORDER BY id
             LIMIT ?3 OFFSET ?4",
        )?;
        let links = stmt
            .query_map(
                params![
                    filter.class.map(LinkClass::as_str),
                    filter.account.map(|a| a.0),
                    limit,
                    offset
                ],
                |row| {
                    let class: String = row.get(3)?;
                    Ok(StoredLink {
                        id: row.get(0)?,
                        record: LinkRecord {
                            raw_url: row.get(1)?,
                            normalized_url: row.get(2)?,
                            class: class.parse().map_err(|e| conversion_error(3, e))?,
                            account_id: AccountId(row.get(4)?),
                            chat_id: row.get(5)?,
                            discovered_at: timestamp(row, 6)?,
                        },
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    /// Serialize the (filtered) links table into a JSON array at `path`.
    /// Returns the number of links written.
    pub fn export_json(&self, path: &Path, filter: Option<&LinkFilter>) -> Result<usize> {
        let links = self.list_links(filter, u32::MAX, 0)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &links)
            .map_err(|e| CollectorError::Io(e.into()))?;
        log::info!("Exported {} links to {}", links.len(), path.display());
        Ok(links.len())
    }

    // ==================== Collection runs ====================

    pub fn start_run(&self) -> Result<RunId> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO collection_runs (started_at, status) VALUES (?1, 'running')",
            [util::now().to_rfc3339()],
        )?;
        Ok(RunId(conn.last_insert_rowid()))
    }

    pub fn finish_run(&self, run: RunId, status: &str, links_collected: u64) -> Result<()> {
        self.conn().execute(
            "UPDATE collection_runs
             SET ended_at = ?1, status = ?2, links_collected = ?3
             WHERE id = ?4",
            params![
                util::now().to_rfc3339(),
                status,
                i64::try_from(links_collected).unwrap_or(i64::MAX),
                run.0
            ],
        )?;
        Ok(())
    }

    /// `(status, links_collected)` of a run.
    pub fn run_summary(&self, run: RunId) -> Result<Option<(String, u64)>> {
        let row = self
            .conn()
            .query_row(
                "SELECT status, links_collected FROM collection_runs WHERE id = ?1",
                [run.0],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(status, n)| (status, u64::try_from(n).unwrap_or_default())))
    }
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => timestamp(row, idx).map(Some),
        None => Ok(None),
    }
}

fn conversion_error(idx: usize, err: CollectorError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}
