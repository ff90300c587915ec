//! Relational storage backends (PostgreSQL, MySQL, SQLite) via sqlx
//!
//! All three share one table layout. The schema is created on connect if it
//! does not exist. Concurrency is left to the connection pool and the database.

use super::{IdStamper, StoreError, TelemetryStore, RECENT_LIMIT};
use crate::config::SqlSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use speedtest_shared::TelemetryRecord;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

const COLUMNS: &str = "uuid, timestamp, ip, ispinfo, extra, ua, lang, dl, ul, ping, jitter, log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    fn name(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgresql",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
        }
    }

    fn create_table(self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "CREATE TABLE IF NOT EXISTS speedtest_users (
                    id BIGSERIAL PRIMARY KEY,
                    uuid TEXT NOT NULL UNIQUE,
                    timestamp TIMESTAMPTZ NOT NULL,
                    ip TEXT NOT NULL,
                    ispinfo TEXT NOT NULL,
                    extra TEXT NOT NULL,
                    ua TEXT NOT NULL,
                    lang TEXT NOT NULL,
                    dl TEXT NOT NULL,
                    ul TEXT NOT NULL,
                    ping TEXT NOT NULL,
                    jitter TEXT NOT NULL,
                    log TEXT NOT NULL
                )"
            }
            Dialect::MySql => {
                "CREATE TABLE IF NOT EXISTS speedtest_users (
                    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                    uuid VARCHAR(36) NOT NULL UNIQUE,
                    timestamp DATETIME(3) NOT NULL,
                    ip TEXT NOT NULL,
                    ispinfo TEXT NOT NULL,
                    extra TEXT NOT NULL,
                    ua TEXT NOT NULL,
                    lang TEXT NOT NULL,
                    dl TEXT NOT NULL,
                    ul TEXT NOT NULL,
                    ping TEXT NOT NULL,
                    jitter TEXT NOT NULL,
                    log LONGTEXT NOT NULL
                )"
            }
            Dialect::Sqlite => {
                "CREATE TABLE IF NOT EXISTS speedtest_users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    timestamp TEXT NOT NULL,
                    ip TEXT NOT NULL,
                    ispinfo TEXT NOT NULL,
                    extra TEXT NOT NULL,
                    ua TEXT NOT NULL,
                    lang TEXT NOT NULL,
                    dl TEXT NOT NULL,
                    ul TEXT NOT NULL,
                    ping TEXT NOT NULL,
                    jitter TEXT NOT NULL,
                    log TEXT NOT NULL
                )"
            }
        }
    }

    fn insert(self) -> String {
        let placeholders = match self {
            Dialect::Postgres => "$1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12",
            Dialect::MySql | Dialect::Sqlite => "?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?",
        };
        format!("INSERT INTO speedtest_users ({COLUMNS}) VALUES ({placeholders})")
    }

    fn select_by_id(self) -> String {
        let placeholder = match self {
            Dialect::Postgres => "$1",
            Dialect::MySql | Dialect::Sqlite => "?",
        };
        format!("SELECT {COLUMNS} FROM speedtest_users WHERE uuid = {placeholder}")
    }

    /// Newest first by ULID, which sorts by creation time.
    fn select_recent(self) -> String {
        let placeholder = match self {
            Dialect::Postgres => "$1",
            Dialect::MySql | Dialect::Sqlite => "?",
        };
        format!("SELECT {COLUMNS} FROM speedtest_users ORDER BY uuid DESC LIMIT {placeholder}")
    }
}

/// One row of `speedtest_users`
#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    uuid: String,
    timestamp: DateTime<Utc>,
    ip: String,
    ispinfo: String,
    extra: String,
    ua: String,
    lang: String,
    dl: String,
    ul: String,
    ping: String,
    jitter: String,
    log: String,
}

impl From<RecordRow> for TelemetryRecord {
    fn from(row: RecordRow) -> Self {
        TelemetryRecord {
            id: row.uuid,
            timestamp: row.timestamp,
            ip_address: row.ip,
            isp_info: row.ispinfo,
            extra: row.extra,
            user_agent: row.ua,
            language: row.lang,
            download: row.dl,
            upload: row.ul,
            ping: row.ping,
            jitter: row.jitter,
            log: row.log,
        }
    }
}

enum SqlPool {
    Postgres(PgPool),
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

/// Run the same expression against whichever pool is live.
macro_rules! on_pool {
    ($pool:expr, $p:ident => $body:expr) => {
        match $pool {
            SqlPool::Postgres($p) => $body,
            SqlPool::MySql($p) => $body,
            SqlPool::Sqlite($p) => $body,
        }
    };
}

pub struct SqlStore {
    pool: SqlPool,
    dialect: Dialect,
    stamper: IdStamper,
}

impl SqlStore {
    pub async fn connect_postgres(settings: &SqlSettings) -> Result<Self, StoreError> {
        let (host, port) = settings.host_and_port();
        let mut options = PgConnectOptions::new()
            .host(host)
            .username(&settings.username)
            .password(&settings.password)
            .database(&settings.database);
        if let Some(port) = port {
            options = options.port(port);
        }

        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::storage(format!("postgresql connect to {}: {}", host, e)))?;

        Self::with_schema(SqlPool::Postgres(pool), Dialect::Postgres).await
    }

    pub async fn connect_mysql(settings: &SqlSettings) -> Result<Self, StoreError> {
        let (host, port) = settings.host_and_port();
        let mut options = MySqlConnectOptions::new()
            .host(host)
            .username(&settings.username)
            .password(&settings.password)
            .database(&settings.database);
        if let Some(port) = port {
            options = options.port(port);
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::storage(format!("mysql connect to {}: {}", host, e)))?;

        Self::with_schema(SqlPool::MySql(pool), Dialect::MySql).await
    }

    /// Open a SQLite file, creating it if needed. `:memory:` gives a private
    /// in-memory database held by a single connection for the pool's lifetime.
    pub async fn open_sqlite(path: &str) -> Result<Self, StoreError> {
        let pool = if path == ":memory:" {
            let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(StoreError::storage)?;
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
                .connect_with(options)
                .await
        } else {
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new()
                .max_connections(MAX_CONNECTIONS)
                .acquire_timeout(ACQUIRE_TIMEOUT)
                .connect_with(options)
                .await
        }
        .map_err(|e| StoreError::storage(format!("sqlite open {}: {}", path, e)))?;

        Self::with_schema(SqlPool::Sqlite(pool), Dialect::Sqlite).await
    }

    async fn with_schema(pool: SqlPool, dialect: Dialect) -> Result<Self, StoreError> {
        let ddl = dialect.create_table();
        on_pool!(&pool, p => sqlx::query(ddl).execute(p).await.map(|_| ()))
            .map_err(|e| StoreError::storage(format!("{} schema: {}", dialect.name(), e)))?;

        tracing::info!("Telemetry table ready ({})", dialect.name());
        Ok(Self {
            pool,
            dialect,
            stamper: IdStamper::new(),
        })
    }
}

#[async_trait]
impl TelemetryStore for SqlStore {
    async fn insert(&self, mut record: TelemetryRecord) -> Result<String, StoreError> {
        let id = self.stamper.stamp(&mut record)?;
        let sql = self.dialect.insert();

        on_pool!(&self.pool, p => sqlx::query(&sql)
            .bind(&record.id)
            .bind(record.timestamp)
            .bind(&record.ip_address)
            .bind(&record.isp_info)
            .bind(&record.extra)
            .bind(&record.user_agent)
            .bind(&record.language)
            .bind(&record.download)
            .bind(&record.upload)
            .bind(&record.ping)
            .bind(&record.jitter)
            .bind(&record.log)
            .execute(p)
            .await
            .map(|_| ()))
        .map_err(StoreError::storage)?;

        Ok(id)
    }

    async fn fetch_by_id(&self, id: &str) -> Result<TelemetryRecord, StoreError> {
        let sql = self.dialect.select_by_id();
        let row = on_pool!(&self.pool, p => sqlx::query_as::<_, RecordRow>(&sql)
            .bind(id)
            .fetch_optional(p)
            .await)
        .map_err(StoreError::storage)?;

        row.map(TelemetryRecord::from)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn fetch_recent(&self, limit: usize) -> Result<Vec<TelemetryRecord>, StoreError> {
        let limit = limit.min(RECENT_LIMIT);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let sql = self.dialect.select_recent();
        let rows = on_pool!(&self.pool, p => sqlx::query_as::<_, RecordRow>(&sql)
            .bind(limit as i64)
            .fetch_all(p)
            .await)
        .map_err(StoreError::storage)?;

        Ok(rows.into_iter().map(TelemetryRecord::from).collect())
    }

    fn backend(&self) -> &'static str {
        self.dialect.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;
    use std::sync::Arc;

    async fn memory_store() -> SqlStore {
        SqlStore::open_sqlite(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_contract_sqlite() {
        contract::round_trip(&memory_store().await).await;
        contract::caller_stamp_is_ignored(&memory_store().await).await;
        contract::missing_id_is_not_found(&memory_store().await).await;
        contract::recent_is_newest_first(&memory_store().await).await;
        contract::concurrent_ids_are_unique(Arc::new(memory_store().await), 32).await;
    }

    #[tokio::test]
    async fn test_sqlite_file_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speedtest.db");
        let path = path.to_str().unwrap();

        let id = {
            let store = SqlStore::open_sqlite(path).await.unwrap();
            store.insert(contract::sample(3)).await.unwrap()
        };

        let store = SqlStore::open_sqlite(path).await.unwrap();
        let record = store.fetch_by_id(&id).await.unwrap();
        assert_eq!(record.extra, "run-3");
        assert_eq!(store.backend(), "sqlite");
    }

    #[tokio::test]
    async fn test_recent_capped_at_hundred() {
        let store = memory_store().await;
        for n in 0..105 {
            store.insert(contract::sample(n)).await.unwrap();
        }
        let recent = store.fetch_recent(1000).await.unwrap();
        assert_eq!(recent.len(), RECENT_LIMIT);
        assert_eq!(recent[0].extra, "run-104");
        assert!(store.fetch_recent(0).await.unwrap().is_empty());
    }

    #[test]
    fn test_placeholders_per_dialect() {
        assert!(Dialect::Postgres.insert().ends_with("$12)"));
        assert!(Dialect::MySql.select_by_id().ends_with("uuid = ?"));
        assert!(Dialect::Sqlite.select_recent().contains("ORDER BY uuid DESC"));
    }

    #[tokio::test]
    async fn test_recent_follows_ulid_not_row_order() {
        let store = memory_store().await;
        let newest = store.insert(contract::sample(1)).await.unwrap();

        // A row written later (e.g. an import) but carrying an older id.
        let sql = store.dialect.insert();
        let imported = contract::sample(2);
        on_pool!(&store.pool, p => sqlx::query(&sql)
            .bind("00000000000000000000000000")
            .bind(Utc::now())
            .bind(&imported.ip_address)
            .bind(&imported.isp_info)
            .bind(&imported.extra)
            .bind(&imported.user_agent)
            .bind(&imported.language)
            .bind(&imported.download)
            .bind(&imported.upload)
            .bind(&imported.ping)
            .bind(&imported.jitter)
            .bind(&imported.log)
            .execute(p)
            .await
            .map(|_| ()))
        .unwrap();

        let recent = store.fetch_recent(2).await.unwrap();
        assert_eq!(recent[0].id, newest);
        assert_eq!(recent[1].id, "00000000000000000000000000");
    }
}
