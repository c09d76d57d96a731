//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::mailbox::{Credentials, Provider};
use crate::store::migrations;
use crate::store::traits::{Account, ConversationThread, Database, NewAccount, Watermark};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// A handle on the shared connection, for components that keep
    /// their own tables in the same database (the job queue).
    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_accounts(
        &self,
        context: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Account>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut accounts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
        {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Watermarks are stored as INTEGER; anything out of `u32` range reads as 0.
fn to_watermark(v: i64) -> u32 {
    u32::try_from(v).unwrap_or(0)
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

fn row_to_account(row: &libsql::Row) -> Result<Account, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("account row parse: {e}"));

    let provider_str: String = row.get(2).map_err(parse)?;
    let provider: Provider = provider_str.parse().map_err(DatabaseError::Query)?;
    let secret: String = row.get(4).map_err(parse)?;
    let created_str: String = row.get(8).map_err(parse)?;

    Ok(Account {
        id: row.get(0).map_err(parse)?,
        user_id: row.get(1).map_err(parse)?,
        provider,
        credentials: Credentials {
            address: row.get(3).map_err(parse)?,
            secret: SecretString::from(secret),
        },
        group_id: row.get::<i64>(5).ok(),
        enqueued_watermark: to_watermark(row.get(6).map_err(parse)?),
        delivered_watermark: to_watermark(row.get(7).map_err(parse)?),
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_thread(row: &libsql::Row) -> Result<ConversationThread, libsql::Error> {
    let created_str: String = row.get(4)?;
    Ok(ConversationThread {
        group_id: row.get(0)?,
        sender_address: row.get(1)?,
        thread_id: row.get(2)?,
        label: row.get::<String>(3).unwrap_or_default(),
        created_at: parse_datetime(&created_str),
    })
}

/// Thread keys are case-insensitive addresses.
fn thread_key(sender_address: &str) -> String {
    sender_address.trim().to_lowercase()
}

// ── Trait implementation ────────────────────────────────────────────

const ACCOUNT_COLUMNS: &str = "id, user_id, provider, address, secret, group_id, enqueued_watermark, delivered_watermark, created_at";

const THREAD_COLUMNS: &str = "group_id, sender_address, thread_id, label, created_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Accounts ────────────────────────────────────────────────────

    async fn insert_account(&self, account: &NewAccount) -> Result<Account, DatabaseError> {
        let now = Utc::now();
        let address = account.address.trim().to_string();

        let mut rows = self
            .conn()
            .query(
                "INSERT INTO accounts (user_id, provider, address, secret, created_at) VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
                params![
                    account.user_id,
                    account.provider.id(),
                    address.clone(),
                    account.secret.expose_secret().to_string(),
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DatabaseError::Constraint(format!("mailbox {address} is already connected"))
                } else {
                    DatabaseError::Query(format!("insert_account: {e}"))
                }
            })?;

        let id: i64 = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("insert_account id: {e}")))?,
            Ok(None) => return Err(DatabaseError::Query("insert_account returned no id".into())),
            Err(e) if is_unique_violation(&e) => {
                return Err(DatabaseError::Constraint(format!(
                    "mailbox {address} is already connected"
                )));
            }
            Err(e) => return Err(DatabaseError::Query(format!("insert_account: {e}"))),
        };

        info!(account_id = id, user_id = account.user_id, provider = %account.provider, "Account created");
        Ok(Account {
            id,
            user_id: account.user_id,
            provider: account.provider,
            credentials: Credentials {
                address,
                secret: account.secret.clone(),
            },
            group_id: None,
            enqueued_watermark: 0,
            delivered_watermark: 0,
            created_at: now,
        })
    }

    async fn get_account(&self, id: i64) -> Result<Option<Account>, DatabaseError> {
        let accounts = self
            .query_accounts(
                "get_account",
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1 AND deleted_at IS NULL"),
                params![id],
            )
            .await?;
        Ok(accounts.into_iter().next())
    }

    async fn list_grouped_accounts(&self) -> Result<Vec<Account>, DatabaseError> {
        self.query_accounts(
            "list_grouped_accounts",
            &format!(
                "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE group_id IS NOT NULL AND deleted_at IS NULL ORDER BY id"
            ),
            (),
        )
        .await
    }

    async fn find_ungrouped_account_by_user(
        &self,
        user_id: i64,
    ) -> Result<Option<Account>, DatabaseError> {
        let accounts = self
            .query_accounts(
                "find_ungrouped_account_by_user",
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = ?1 AND group_id IS NULL AND deleted_at IS NULL ORDER BY id LIMIT 1"
                ),
                params![user_id],
            )
            .await?;
        Ok(accounts.into_iter().next())
    }

    async fn find_account_by_group(
        &self,
        group_id: i64,
    ) -> Result<Option<Account>, DatabaseError> {
        let accounts = self
            .query_accounts(
                "find_account_by_group",
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE group_id = ?1 AND deleted_at IS NULL ORDER BY id LIMIT 1"
                ),
                params![group_id],
            )
            .await?;
        Ok(accounts.into_iter().next())
    }

    async fn set_group(&self, account_id: i64, group_id: i64) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE accounts SET group_id = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                params![account_id, group_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_group: {e}")))?;

        debug!(account_id, group_id, changed, "Account group set");
        Ok(changed > 0)
    }

    async fn delete_account(&self, account_id: i64) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE accounts SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                params![account_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_account: {e}")))?;

        if changed > 0 {
            info!(account_id, "Account deleted");
        }
        Ok(changed > 0)
    }

    async fn advance_watermark(
        &self,
        account_id: i64,
        watermark: Watermark,
        candidate: u32,
    ) -> Result<bool, DatabaseError> {
        let column = watermark.column();
        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE accounts SET {column} = ?2 WHERE id = ?1 AND deleted_at IS NULL AND {column} < ?2"
                ),
                params![account_id, i64::from(candidate)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_watermark: {e}")))?;

        if changed > 0 {
            debug!(account_id, watermark = column, candidate, "Watermark advanced");
        }
        Ok(changed > 0)
    }

    // ── Conversation threads ────────────────────────────────────────

    async fn get_thread(
        &self,
        group_id: i64,
        sender_address: &str,
    ) -> Result<Option<ConversationThread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM conversation_threads WHERE group_id = ?1 AND sender_address = ?2"
                ),
                params![group_id, thread_key(sender_address)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_thread: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let thread = row_to_thread(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_thread row parse: {e}")))?;
                Ok(Some(thread))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_thread: {e}"))),
        }
    }

    async fn insert_thread_if_absent(
        &self,
        group_id: i64,
        sender_address: &str,
        thread_id: i64,
        label: &str,
    ) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO conversation_threads (group_id, sender_address, thread_id, label, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    group_id,
                    thread_key(sender_address),
                    thread_id,
                    label,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_thread_if_absent: {e}")))?;

        debug!(group_id, thread_id, inserted, "Conversation thread stored");
        Ok(inserted > 0)
    }

    async fn delete_thread(
        &self,
        group_id: i64,
        sender_address: &str,
    ) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM conversation_threads WHERE group_id = ?1 AND sender_address = ?2",
                params![group_id, thread_key(sender_address)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_thread: {e}")))?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand::seq::SliceRandom;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn new_account(user_id: i64, address: &str) -> NewAccount {
        NewAccount {
            user_id,
            provider: Provider::Gmail,
            address: address.to_string(),
            secret: SecretString::from("app-password".to_string()),
        }
    }

    // ── Account tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_account() {
        let db = test_db().await;
        let created = db.insert_account(&new_account(10, "a@example.com")).await.unwrap();

        let fetched = db.get_account(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.user_id, 10);
        assert_eq!(fetched.provider, Provider::Gmail);
        assert_eq!(fetched.credentials.address, "a@example.com");
        assert_eq!(fetched.credentials.secret.expose_secret(), "app-password");
        assert_eq!(fetched.group_id, None);
        assert_eq!(fetched.cursor(), 0);
    }

    #[tokio::test]
    async fn get_account_not_found() {
        let db = test_db().await;
        assert!(db.get_account(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_live_address_is_constraint_error() {
        let db = test_db().await;
        db.insert_account(&new_account(1, "dup@example.com")).await.unwrap();
        let err = db.insert_account(&new_account(2, "dup@example.com")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn address_reusable_after_delete() {
        let db = test_db().await;
        let first = db.insert_account(&new_account(1, "re@example.com")).await.unwrap();
        assert!(db.delete_account(first.id).await.unwrap());
        db.insert_account(&new_account(1, "re@example.com")).await.unwrap();
    }

    #[tokio::test]
    async fn deleted_account_is_invisible() {
        let db = test_db().await;
        let acc = db.insert_account(&new_account(1, "gone@example.com")).await.unwrap();
        db.set_group(acc.id, -100).await.unwrap();
        assert!(db.delete_account(acc.id).await.unwrap());
        assert!(!db.delete_account(acc.id).await.unwrap());

        assert!(db.get_account(acc.id).await.unwrap().is_none());
        assert!(db.find_account_by_group(-100).await.unwrap().is_none());
        assert!(db.list_grouped_accounts().await.unwrap().is_empty());
        assert!(!db.set_group(acc.id, -200).await.unwrap());
        assert!(!db.advance_watermark(acc.id, Watermark::Enqueued, 5).await.unwrap());
    }

    #[tokio::test]
    async fn grouping_lifecycle() {
        let db = test_db().await;
        let a = db.insert_account(&new_account(7, "a@example.com")).await.unwrap();
        let b = db.insert_account(&new_account(7, "b@example.com")).await.unwrap();

        let ungrouped = db.find_ungrouped_account_by_user(7).await.unwrap().unwrap();
        assert_eq!(ungrouped.id, a.id);
        assert!(db.list_grouped_accounts().await.unwrap().is_empty());

        assert!(db.set_group(a.id, -1001).await.unwrap());
        let ungrouped = db.find_ungrouped_account_by_user(7).await.unwrap().unwrap();
        assert_eq!(ungrouped.id, b.id);

        let grouped = db.list_grouped_accounts().await.unwrap();
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].group_id, Some(-1001));
        assert_eq!(db.find_account_by_group(-1001).await.unwrap().unwrap().id, a.id);
        assert!(db.find_ungrouped_account_by_user(8).await.unwrap().is_none());
    }

    // ── Watermark tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let db = test_db().await;
        let acc = db.insert_account(&new_account(1, "w@example.com")).await.unwrap();

        assert!(db.advance_watermark(acc.id, Watermark::Enqueued, 7).await.unwrap());
        assert!(!db.advance_watermark(acc.id, Watermark::Enqueued, 5).await.unwrap());
        assert!(!db.advance_watermark(acc.id, Watermark::Enqueued, 7).await.unwrap());

        let fetched = db.get_account(acc.id).await.unwrap().unwrap();
        assert_eq!(fetched.enqueued_watermark, 7);
        assert_eq!(fetched.delivered_watermark, 0);
    }

    #[tokio::test]
    async fn watermarks_are_independent() {
        let db = test_db().await;
        let acc = db.insert_account(&new_account(1, "w@example.com")).await.unwrap();

        db.advance_watermark(acc.id, Watermark::Delivered, 9).await.unwrap();
        db.advance_watermark(acc.id, Watermark::Enqueued, 4).await.unwrap();

        let fetched = db.get_account(acc.id).await.unwrap().unwrap();
        assert_eq!(fetched.enqueued_watermark, 4);
        assert_eq!(fetched.delivered_watermark, 9);
        assert_eq!(fetched.cursor(), 9);
    }

    #[tokio::test]
    async fn random_advance_sequence_tracks_running_max() {
        let db = test_db().await;
        let acc = db.insert_account(&new_account(1, "r@example.com")).await.unwrap();

        let mut candidates: Vec<u32> = {
            let mut rng = rand::thread_rng();
            (0..200).map(|_| rng.gen_range(1..10_000)).collect()
        };
        candidates.shuffle(&mut rand::thread_rng());

        let mut expected = 0u32;
        for c in candidates {
            let moved = db.advance_watermark(acc.id, Watermark::Delivered, c).await.unwrap();
            assert_eq!(moved, c > expected, "candidate {c} against {expected}");
            expected = expected.max(c);
            let stored = db.get_account(acc.id).await.unwrap().unwrap().delivered_watermark;
            assert_eq!(stored, expected);
        }
    }

    #[tokio::test]
    async fn concurrent_advances_settle_on_max() {
        let db = Arc::new(test_db().await);
        let acc = db.insert_account(&new_account(1, "c@example.com")).await.unwrap();

        let candidates: Vec<u32> = {
            let mut rng = rand::thread_rng();
            (0..64).map(|_| rng.gen_range(1..1_000_000)).collect()
        };
        let max = candidates.iter().copied().max().unwrap();
        let id = acc.id;

        let mut handles = Vec::new();
        for (i, c) in candidates.into_iter().enumerate() {
            let db = Arc::clone(&db);
            let mark = if i % 2 == 0 { Watermark::Enqueued } else { Watermark::Delivered };
            handles.push(tokio::spawn(async move {
                db.advance_watermark(id, mark, c).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let fetched = db.get_account(id).await.unwrap().unwrap();
        assert_eq!(fetched.cursor(), max);
    }

    // ── Thread tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn thread_insert_if_absent_keeps_first() {
        let db = test_db().await;
        assert!(db.insert_thread_if_absent(-1, "Bob@Example.com", 11, "bob@example.com").await.unwrap());
        assert!(!db.insert_thread_if_absent(-1, "bob@example.com", 22, "bob@example.com").await.unwrap());

        let thread = db.get_thread(-1, "BOB@example.com").await.unwrap().unwrap();
        assert_eq!(thread.thread_id, 11);
        assert_eq!(thread.sender_address, "bob@example.com");
        assert_eq!(thread.label, "bob@example.com");
    }

    #[tokio::test]
    async fn threads_are_scoped_by_group() {
        let db = test_db().await;
        db.insert_thread_if_absent(-1, "x@example.com", 1, "x").await.unwrap();
        assert!(db.get_thread(-2, "x@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_thread_allows_recreate() {
        let db = test_db().await;
        db.insert_thread_if_absent(-1, "x@example.com", 1, "x").await.unwrap();
        assert!(db.delete_thread(-1, "x@example.com").await.unwrap());
        assert!(!db.delete_thread(-1, "x@example.com").await.unwrap());
        assert!(db.insert_thread_if_absent(-1, "x@example.com", 2, "x").await.unwrap());
        assert_eq!(db.get_thread(-1, "x@example.com").await.unwrap().unwrap().thread_id, 2);
    }

    #[tokio::test]
    async fn local_file_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("relay.db");
        let id = {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            let acc = db.insert_account(&new_account(1, "p@example.com")).await.unwrap();
            db.advance_watermark(acc.id, Watermark::Enqueued, 42).await.unwrap();
            acc.id
        };
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.get_account(id).await.unwrap().unwrap().enqueued_watermark, 42);
    }
}
