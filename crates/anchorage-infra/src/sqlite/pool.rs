//! Connection pools for the workflow database.
//!
//! The store writes through a single connection so saves never contend for
//! the SQLite write lock, and reads through a small read-only pool. WAL mode
//! lets readers keep a consistent snapshot while a save is committing.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

const READER_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Reader and writer pools over one database file.
#[derive(Clone)]
pub struct DatabasePool {
    /// Read-only connections for `load` and `list`.
    pub reader: SqlitePool,
    /// The only connection allowed to write.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if needed) the database at `database_url` and bring
    /// its schema up to date.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        // The reader pool opens read-only, so the schema must exist first.
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(options.read_only(true))
            .await?;

        Ok(Self { reader, writer })
    }
}

/// Directory holding the database and `anchorage.toml`.
///
/// `ANCHORAGE_DATA_DIR` wins; otherwise `~/.anchorage`.
pub fn default_data_dir() -> PathBuf {
    std::env::var_os("ANCHORAGE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".anchorage")
        })
}

/// Returns the default database URL, `{data_dir}/anchorage.db`.
pub fn default_database_url() -> String {
    format!("sqlite://{}/anchorage.db", default_data_dir().display())
}

/// Fresh database in a temporary directory that outlives the test.
#[cfg(test)]
pub(crate) async fn test_pool() -> DatabasePool {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("anchorage.db").display());
    std::mem::forget(dir);
    DatabasePool::new(&url).await.unwrap()
}
