use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, Level};
use logging_timer::timer;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};

use crate::config::DatabaseConfig;
use crate::context::RequestContext;
use crate::error::{FaultLogError, StoreError};
use crate::record::{ErrorRecord, NewErrorRecord};

/// The read/write boundary to the error log table.
///
/// Writes are fail-open: `append` reports failure as `false` and never returns an
/// error. Reads are fail-closed: `read_all` surfaces the exact step that failed.
#[derive(Clone)]
pub struct ErrorStore {
    pool: Pool<SqliteConnectionManager>,
    table: String,
    db_path: PathBuf,
}

impl ErrorStore {
    /// Creates a store for the database at `db_path`. No connection is made until the
    /// first operation, so an unreachable database shows up as a per-operation failure.
    pub fn open(db_path: &Path, table: &str, connect_timeout: Duration) -> Self {
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(4)
            .min_idle(Some(0))
            .connection_timeout(connect_timeout)
            .build_unchecked(manager);

        ErrorStore {
            pool,
            table: table.to_owned(),
            db_path: db_path.to_owned(),
        }
    }

    pub fn from_config(config: &DatabaseConfig, data_dir: &Path) -> Self {
        Self::open(
            &config.db_path(data_dir),
            &config.table_name,
            Duration::from_millis(config.connect_timeout_ms),
        )
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn connection(&self) -> Result<PooledConnection<SqliteConnectionManager>, r2d2::Error> {
        self.pool.get()
    }

    /// Creates the error log table if it doesn't exist yet.
    pub fn ensure_table(&self) -> Result<(), FaultLogError> {
        let conn = self.connection()?;
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                ID INTEGER PRIMARY KEY AUTOINCREMENT,
                MESSAGE VARCHAR(1000) NOT NULL,
                FILE VARCHAR(1000) NOT NULL,
                LOG_TIME INTEGER NOT NULL,
                PHP_ERROR_MESSAGE VARCHAR(1000) NOT NULL,
                LINE INTEGER NOT NULL,
                TRACE VARCHAR(2000) NOT NULL,
                EXCEPTION_MESSAGE VARCHAR(1000) NOT NULL,
                IP VARCHAR(256) NOT NULL
            );"#,
            table = self.table
        );
        conn.execute_batch(&sql)?;

        info!("Error log table '{}' ready in {}", self.table, self.db_path.display());
        Ok(())
    }

    /// Writes one record. Returns `true` only if the insert fully succeeded.
    ///
    /// The write time and the remote address of the current request are filled in
    /// here. A single attempt is made; the caller carries on either way.
    pub fn append(&self, record: &NewErrorRecord) -> bool {
        let conn = match self.connection() {
            Ok(conn) => conn,
            Err(e) => {
                debug!("Error log append: connection failed: {}", e);
                return false;
            }
        };

        let sql = format!(
            r#"INSERT INTO "{}" (MESSAGE, FILE, LOG_TIME, PHP_ERROR_MESSAGE, LINE, TRACE, EXCEPTION_MESSAGE, IP)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
            self.table
        );

        let mut stmt = match conn.prepare(&sql) {
            Ok(stmt) => stmt,
            Err(e) => {
                debug!("Error log append: prepare failed: {}", e);
                return false;
            }
        };

        let log_time = chrono::Utc::now().timestamp();
        let remote_address = RequestContext::remote_address_column();

        match stmt.execute(params![
            record.message(),
            record.file(),
            log_time,
            record.runtime_error_message(),
            record.line(),
            record.trace(),
            record.exception_message(),
            remote_address,
        ]) {
            Ok(_) => true,
            Err(e) => {
                debug!("Error log append: bind/execute failed: {}", e);
                false
            }
        }
    }

    /// Reads every record, newest first.
    pub fn read_all(&self) -> Result<Vec<ErrorRecord>, StoreError> {
        let _tmr = timer!(Level::Trace; "ErrorStore::read_all");

        let conn = self.connection().map_err(StoreError::Connection)?;

        let sql = format!(
            r#"SELECT ID, MESSAGE, FILE, LOG_TIME, PHP_ERROR_MESSAGE, LINE, TRACE, EXCEPTION_MESSAGE, IP
               FROM "{}"
               ORDER BY ID DESC"#,
            self.table
        );

        let mut stmt = conn.prepare(&sql).map_err(StoreError::Prepare)?;
        let mut rows = stmt.query([]).map_err(StoreError::Execute)?;

        let mut records = Vec::new();
        let mut first_step = true;

        loop {
            let row = match rows.next() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                // The first step is where the statement actually runs
                Err(e) if first_step => return Err(StoreError::Execute(e)),
                Err(e) => return Err(StoreError::Fetch(e)),
            };
            first_step = false;

            records.push(Self::record_from_row(row).map_err(StoreError::Bind)?);
        }

        Ok(records)
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<i64, StoreError> {
        let conn = self.connection().map_err(StoreError::Connection)?;
        let sql = format!(r#"SELECT COUNT(*) FROM "{}""#, self.table);

        let mut stmt = conn.prepare(&sql).map_err(StoreError::Prepare)?;
        let mut rows = stmt.query([]).map_err(StoreError::Execute)?;

        match rows.next() {
            Ok(Some(row)) => row.get(0).map_err(StoreError::Bind),
            Ok(None) => Ok(0),
            Err(e) => Err(StoreError::Execute(e)),
        }
    }

    fn record_from_row(row: &Row) -> Result<ErrorRecord, rusqlite::Error> {
        Ok(ErrorRecord {
            id: row.get(0)?,
            message: row.get(1)?,
            file: row.get(2)?,
            log_time: row.get(3)?,
            runtime_error_message: row.get(4)?,
            line: row.get(5)?,
            trace: row.get(6)?,
            exception_message: row.get(7)?,
            remote_address: row.get(8)?,
        })
    }
}
