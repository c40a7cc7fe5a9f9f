use std::{env, path::Path, sync::Arc, time::Duration};

use libsql::{Builder, Connection, Database as LibSqlDatabase, Transaction, TransactionBehavior};
use thiserror::Error;

const AUTH_TOKEN_VAR: &str = "LIBSQL_AUTH_TOKEN";
/// How long a local connection waits on another writer before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the rule store. Cloning is cheap; every clone points at the
/// same underlying libsql database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<LibSqlDatabase>,
    /// Set for local files; remote databases handle locking server-side.
    busy_timeout: Option<Duration>,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to build database: {0}")]
    Build(libsql::Error),
    #[error("failed to open connection: {0}")]
    Connect(libsql::Error),
    #[error("failed to execute statement: {0}")]
    Statement(libsql::Error),
    #[error("missing required LIBSQL_AUTH_TOKEN for remote database")]
    MissingAuthToken,
}

enum Location<'a> {
    Local(&'a str),
    Remote(&'a str),
}

impl<'a> Location<'a> {
    fn classify(path: &'a str) -> Self {
        let remote = ["libsql://", "http://", "https://"]
            .iter()
            .any(|scheme| path.starts_with(scheme));
        if remote {
            Location::Remote(path)
        } else {
            Location::Local(path)
        }
    }
}

impl Database {
    pub async fn new(database_path: &Path) -> Result<Self, DbError> {
        let path_str = database_path.to_string_lossy();
        let location = Location::classify(&path_str);
        let busy_timeout = match location {
            Location::Local(_) => Some(BUSY_TIMEOUT),
            Location::Remote(_) => None,
        };
        let inner = match location {
            Location::Remote(url) => {
                let auth_token = env::var(AUTH_TOKEN_VAR)
                    .ok()
                    .filter(|token| !token.is_empty())
                    .ok_or(DbError::MissingAuthToken)?;
                Builder::new_remote(url.to_string(), auth_token)
                    .build()
                    .await
            }
            Location::Local(path) => Builder::new_local(path.to_string()).build().await,
        }
        .map_err(DbError::Build)?;

        Ok(Self {
            inner: Arc::new(inner),
            busy_timeout,
        })
    }

    /// Open a connection with foreign keys enforced, which the rule hierarchy
    /// relies on for cascading deletes. Local connections wait up to
    /// [`BUSY_TIMEOUT`] for a concurrent writer instead of failing.
    pub async fn connection(&self) -> Result<Connection, DbError> {
        let conn = self.inner.connect().map_err(DbError::Connect)?;
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(DbError::Statement)?;
        if let Some(timeout) = self.busy_timeout {
            let mut rows = conn
                .query(
                    &format!("PRAGMA busy_timeout = {}", timeout.as_millis()),
                    (),
                )
                .await
                .map_err(DbError::Statement)?;
            while rows.next().await.map_err(DbError::Statement)?.is_some() {}
        }
        Ok(conn)
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(DbError::Statement)?;
        let _ = rows.next().await.map_err(DbError::Statement)?;
        Ok(())
    }
}

/// Start a transaction that holds the write lock from `BEGIN`, so concurrent
/// writers wait out the busy timeout instead of failing a lock upgrade.
pub async fn write_transaction(conn: &Connection) -> Result<Transaction, libsql::Error> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    #[tokio::test]
    async fn connection_enables_foreign_keys() {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("db.sqlite"))
            .await
            .expect("create db");
        let conn = db.connection().await.expect("open connection");
        let mut rows = conn
            .query("PRAGMA foreign_keys", ())
            .await
            .expect("query pragma");
        let value: i64 = rows
            .next()
            .await
            .expect("row present")
            .expect("row")
            .get(0)
            .expect("get value");
        assert_eq!(value, 1, "foreign_keys pragma should be enabled");

        let mut rows = conn
            .query("PRAGMA busy_timeout", ())
            .await
            .expect("query busy timeout");
        let timeout: i64 = rows
            .next()
            .await
            .expect("row present")
            .expect("row")
            .get(0)
            .expect("get value");
        assert_eq!(timeout, BUSY_TIMEOUT.as_millis() as i64);
    }

    #[tokio::test]
    async fn health_check_runs_simple_query() {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("db.sqlite"))
            .await
            .expect("create db");

        db.health_check().await.expect("health check passes");
    }

    #[tokio::test]
    async fn remote_missing_auth_token_errors() {
        let _guard = ENV_LOCK.lock().expect("lock env");
        unsafe { env::remove_var(AUTH_TOKEN_VAR) };
        let result = Database::new(Path::new("libsql://example.com/db")).await;
        assert!(matches!(result, Err(DbError::MissingAuthToken)));
    }

    #[test]
    fn classifies_remote_schemes() {
        assert!(matches!(
            Location::classify("https://db.example.com"),
            Location::Remote(_)
        ));
        assert!(matches!(
            Location::classify("/var/lib/mailsweep.db"),
            Location::Local(_)
        ));
    }
}
