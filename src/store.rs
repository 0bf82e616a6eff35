//! Record store capabilities and their implementations.
//!
//! The pipeline sees three narrow capabilities: trust lookup, verdict
//! recording and the user directory used by the inbound gate. `SqliteStore`
//! backs them with a local database; `MemoryStore` is used by the
//! `--test-email` mode and in tests.

use crate::components::decision_engine::{ContentQuality, Label, Reason, RiskLevel, Verdict};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub type EventId = i64;

/// Facts about one processed message, persisted next to its verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventMetadata {
    pub user_id: i64,
    /// Domain of the effective sender (original sender when unwrapped).
    pub sender_domain: String,
    pub is_forwarded: bool,
    pub message_id_hash: Option<String>,
    pub model_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: i64,
    pub email_hash: String,
    pub created_at: DateTime<Utc>,
}

/// One event with its verdict, as returned by history queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRecord {
    pub event_id: EventId,
    pub user_id: i64,
    pub sender_domain: String,
    pub is_forwarded: bool,
    pub message_id_hash: Option<String>,
    pub received_at: DateTime<Utc>,
    pub model_version: String,
    pub verdict: Verdict,
}

#[async_trait]
pub trait TrustedDomainLookup: Send + Sync {
    async fn is_trusted(&self, user_id: i64, domain: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait VerdictStore: Send + Sync {
    /// Persist the event and its verdict atomically.
    async fn record(&self, verdict: &Verdict, metadata: &EventMetadata) -> Result<EventId, StoreError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Fails with `Conflict` when the hash is already registered.
    async fn create_user(&self, email_hash: &str) -> Result<User, StoreError>;

    async fn find_user(&self, email_hash: &str) -> Result<Option<User>, StoreError>;

    /// Idempotent: adding an existing domain is a no-op.
    async fn add_trusted_domain(&self, user_id: i64, domain: &str) -> Result<(), StoreError>;

    /// Newest first.
    async fn user_predictions(&self, user_id: i64, limit: usize) -> Result<Vec<PredictionRecord>, StoreError>;
}

/// Everything the inbound handler needs from one backend.
pub trait Store: TrustedDomainLookup + VerdictStore + UserDirectory {}

impl<T: TrustedDomainLookup + VerdictStore + UserDirectory> Store for T {}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('@').to_lowercase()
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email_hash TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS email_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        sender_domain TEXT NOT NULL,
        is_forwarded INTEGER NOT NULL DEFAULT 0,
        message_id_hash TEXT,
        received_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS predictions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email_event_id INTEGER NOT NULL UNIQUE REFERENCES email_events(id),
        model_version TEXT NOT NULL,
        phishing_probability REAL NOT NULL,
        predicted_label TEXT NOT NULL,
        risk_level TEXT NOT NULL,
        reason TEXT NOT NULL,
        degenerate INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS trusted_domains (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        domain TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (user_id, domain)
    );
    CREATE INDEX IF NOT EXISTS idx_email_events_user ON email_events(user_id, received_at);
";

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Task(format!("invalid timestamp '{}': {}", value, e)))
}

/// SQLite-backed store. The connection is shared behind a mutex and every
/// query runs on the blocking thread pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        log::info!("Opened verdict database at {}", path.as_ref().display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, task: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Task("database connection lock poisoned".to_string()))?;
            task(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    fn read_user(conn: &Connection, email_hash: &str) -> Result<Option<User>, StoreError> {
        let row = conn
            .query_row(
                "SELECT id, email_hash, created_at FROM users WHERE email_hash = ?1",
                params![email_hash],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()?;

        match row {
            Some((id, email_hash, created_at)) => Ok(Some(User {
                id,
                email_hash,
                created_at: parse_timestamp(&created_at)?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TrustedDomainLookup for SqliteStore {
    async fn is_trusted(&self, user_id: i64, domain: &str) -> Result<bool, StoreError> {
        let domain = normalize_domain(domain);
        self.run(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM trusted_domains WHERE user_id = ?1 AND domain = ?2",
                    params![user_id, domain],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }
}

#[async_trait]
impl VerdictStore for SqliteStore {
    async fn record(&self, verdict: &Verdict, metadata: &EventMetadata) -> Result<EventId, StoreError> {
        let verdict = verdict.clone();
        let metadata = metadata.clone();
        self.run(move |conn| {
            let now = timestamp(Utc::now());
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO email_events (user_id, sender_domain, is_forwarded, message_id_hash, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    metadata.user_id,
                    metadata.sender_domain,
                    metadata.is_forwarded,
                    metadata.message_id_hash,
                    now
                ],
            )?;
            let event_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO predictions (email_event_id, model_version, phishing_probability, predicted_label,
                                          risk_level, reason, degenerate, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event_id,
                    metadata.model_version,
                    verdict.phishing_probability,
                    verdict.predicted_label.as_str(),
                    verdict.risk_level.as_str(),
                    verdict.reason.as_str(),
                    verdict.is_degenerate(),
                    now
                ],
            )?;
            tx.commit()?;
            Ok(event_id)
        })
        .await
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn create_user(&self, email_hash: &str) -> Result<User, StoreError> {
        let email_hash = email_hash.to_string();
        self.run(move |conn| {
            if Self::read_user(conn, &email_hash)?.is_some() {
                return Err(StoreError::Conflict(format!("user {} already exists", email_hash)));
            }
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO users (email_hash, created_at) VALUES (?1, ?2)",
                params![email_hash, timestamp(created_at)],
            )?;
            Ok(User {
                id: conn.last_insert_rowid(),
                email_hash,
                created_at,
            })
        })
        .await
    }

    async fn find_user(&self, email_hash: &str) -> Result<Option<User>, StoreError> {
        let email_hash = email_hash.to_string();
        self.run(move |conn| Self::read_user(conn, &email_hash)).await
    }

    async fn add_trusted_domain(&self, user_id: i64, domain: &str) -> Result<(), StoreError> {
        let domain = normalize_domain(domain);
        self.run(move |conn| {
            let user_exists = conn
                .query_row("SELECT 1 FROM users WHERE id = ?1", params![user_id], |_| Ok(()))
                .optional()?
                .is_some();
            if !user_exists {
                return Err(StoreError::NotFound(format!("user {}", user_id)));
            }
            conn.execute(
                "INSERT OR IGNORE INTO trusted_domains (user_id, domain, created_at) VALUES (?1, ?2, ?3)",
                params![user_id, domain, timestamp(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    async fn user_predictions(&self, user_id: i64, limit: usize) -> Result<Vec<PredictionRecord>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT e.id, e.user_id, e.sender_domain, e.is_forwarded, e.message_id_hash, e.received_at,
                        p.model_version, p.phishing_probability, p.predicted_label, p.risk_level, p.reason,
                        p.degenerate
                 FROM email_events e
                 JOIN predictions p ON p.email_event_id = e.id
                 WHERE e.user_id = ?1
                 ORDER BY e.received_at DESC, e.id DESC
                 LIMIT ?2",
            )?;

            let rows = stmt.query_map(params![user_id, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, bool>(11)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (
                    event_id,
                    user_id,
                    sender_domain,
                    is_forwarded,
                    message_id_hash,
                    received_at,
                    model_version,
                    phishing_probability,
                    label,
                    risk,
                    reason,
                    degenerate,
                ) = row?;

                let corrupt = |field: &str, value: &str| {
                    StoreError::Task(format!("event {} has invalid {} '{}'", event_id, field, value))
                };
                let verdict = Verdict {
                    predicted_label: Label::parse(&label).ok_or_else(|| corrupt("label", &label))?,
                    phishing_probability,
                    risk_level: RiskLevel::parse(&risk).ok_or_else(|| corrupt("risk level", &risk))?,
                    reason: Reason::parse(&reason).ok_or_else(|| corrupt("reason", &reason))?,
                    quality: if degenerate {
                        ContentQuality::Degenerate
                    } else {
                        ContentQuality::Confident
                    },
                };

                records.push(PredictionRecord {
                    event_id,
                    user_id,
                    sender_domain,
                    is_forwarded,
                    message_id_hash,
                    received_at: parse_timestamp(&received_at)?,
                    model_version,
                    verdict,
                });
            }
            Ok(records)
        })
        .await
    }
}

#[derive(Default)]
struct MemoryState {
    users: Vec<User>,
    trusted: HashSet<(i64, String)>,
    records: Vec<PredictionRecord>,
}

/// Process-local store with the same contract as `SqliteStore`.
#[derive(Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Task("memory store lock poisoned".to_string()))
    }

    /// Number of recorded events across all users.
    pub fn event_count(&self) -> usize {
        self.state().map(|s| s.records.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TrustedDomainLookup for MemoryStore {
    async fn is_trusted(&self, user_id: i64, domain: &str) -> Result<bool, StoreError> {
        Ok(self.state()?.trusted.contains(&(user_id, normalize_domain(domain))))
    }
}

#[async_trait]
impl VerdictStore for MemoryStore {
    async fn record(&self, verdict: &Verdict, metadata: &EventMetadata) -> Result<EventId, StoreError> {
        let mut state = self.state()?;
        let event_id = state.records.len() as EventId + 1;
        state.records.push(PredictionRecord {
            event_id,
            user_id: metadata.user_id,
            sender_domain: metadata.sender_domain.clone(),
            is_forwarded: metadata.is_forwarded,
            message_id_hash: metadata.message_id_hash.clone(),
            received_at: Utc::now(),
            model_version: metadata.model_version.clone(),
            verdict: verdict.clone(),
        });
        Ok(event_id)
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn create_user(&self, email_hash: &str) -> Result<User, StoreError> {
        let mut state = self.state()?;
        if state.users.iter().any(|u| u.email_hash == email_hash) {
            return Err(StoreError::Conflict(format!("user {} already exists", email_hash)));
        }
        let user = User {
            id: state.users.len() as i64 + 1,
            email_hash: email_hash.to_string(),
            created_at: Utc::now(),
        };
        state.users.push(user.clone());
        Ok(user)
    }

    async fn find_user(&self, email_hash: &str) -> Result<Option<User>, StoreError> {
        Ok(self.state()?.users.iter().find(|u| u.email_hash == email_hash).cloned())
    }

    async fn add_trusted_domain(&self, user_id: i64, domain: &str) -> Result<(), StoreError> {
        self.state()?.trusted.insert((user_id, normalize_domain(domain)));
        Ok(())
    }

    async fn user_predictions(&self, user_id: i64, limit: usize) -> Result<Vec<PredictionRecord>, StoreError> {
        Ok(self
            .state()?
            .records
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::decision_engine::Prediction;

    fn metadata(user_id: i64, domain: &str) -> EventMetadata {
        EventMetadata {
            user_id,
            sender_domain: domain.to_string(),
            is_forwarded: true,
            message_id_hash: Some("abc123".to_string()),
            model_version: "lr-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_sqlite_user_lifecycle() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = store.create_user("hash-1").await.unwrap();
        assert_eq!(user.id, 1);

        let found = store.find_user("hash-1").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert!(store.find_user("hash-2").await.unwrap().is_none());

        let duplicate = store.create_user("hash-1").await;
        assert!(matches!(duplicate, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_sqlite_trusted_domains_are_idempotent_and_per_user() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = store.create_user("alice").await.unwrap();
        let bob = store.create_user("bob").await.unwrap();

        store.add_trusted_domain(alice.id, "Bank.Example").await.unwrap();
        store.add_trusted_domain(alice.id, "bank.example").await.unwrap();

        assert!(store.is_trusted(alice.id, "bank.example").await.unwrap());
        assert!(store.is_trusted(alice.id, "BANK.EXAMPLE").await.unwrap());
        assert!(!store.is_trusted(bob.id, "bank.example").await.unwrap());
        assert!(!store.is_trusted(alice.id, "mail.bank.example").await.unwrap());

        let missing = store.add_trusted_domain(99, "x.example").await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_sqlite_records_and_reads_back_history() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = store.create_user("carol").await.unwrap();

        let first = Verdict::from_prediction(Prediction::new(Label::Phishing, 0.9));
        let second = Verdict::degenerate();
        let id1 = store.record(&first, &metadata(user.id, "evil.example")).await.unwrap();
        let id2 = store.record(&second, &metadata(user.id, "ok.example")).await.unwrap();
        assert!(id2 > id1);

        let history = store.user_predictions(user.id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_id, id2);
        assert!(history[0].verdict.is_degenerate());
        assert_eq!(history[1].verdict, first);
        assert_eq!(history[1].model_version, "lr-1");
        assert_eq!(history[1].message_id_hash.as_deref(), Some("abc123"));

        assert_eq!(store.user_predictions(user.id, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_rejects_events_for_unknown_user() {
        let store = SqliteStore::open_in_memory().unwrap();
        let verdict = Verdict::exempt(Reason::WhitelistedDomain);
        let result = store.record(&verdict, &metadata(42, "x.example")).await;
        assert!(matches!(result, Err(StoreError::Database(_))));
        assert!(store.user_predictions(42, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verdicts.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            let user = store.create_user("dave").await.unwrap();
            store.add_trusted_domain(user.id, "partner.example").await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let user = store.find_user("dave").await.unwrap().unwrap();
        assert!(store.is_trusted(user.id, "partner.example").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryStore::new();
        let user = store.create_user("erin").await.unwrap();
        assert!(store.create_user("erin").await.is_err());

        store.add_trusted_domain(user.id, "Shop.Example").await.unwrap();
        assert!(store.is_trusted(user.id, "shop.example").await.unwrap());

        let verdict = Verdict::exempt(Reason::TrustedDomain);
        store.record(&verdict, &metadata(user.id, "shop.example")).await.unwrap();
        store.record(&verdict, &metadata(user.id + 1, "shop.example")).await.unwrap();
        assert_eq!(store.event_count(), 2);
        assert_eq!(store.user_predictions(user.id, 10).await.unwrap().len(), 1);
    }
}
