use rusqlite::Connection;

use crate::error::Result;

/// Initialise every table this crate owns.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
/// One JSON document per call; `version` lives in its own column so the
/// optimistic-concurrency check is a single conditional UPDATE.
///
/// Several connections share one database file (store, leases, queue,
/// flags). WAL plus a busy timeout lets concurrent writers block briefly
/// instead of failing with SQLITE_BUSY.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA busy_timeout=5000;",
    )?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS calls (
            call_id      TEXT PRIMARY KEY,
            caller_phone TEXT NOT NULL,
            version      INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL,
            doc          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_calls_phone
            ON calls(caller_phone, created_at DESC);

        CREATE TABLE IF NOT EXISTS leases (
            key        TEXT PRIMARY KEY,
            token      TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS flags (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn open_test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("in-memory sqlite");
    init_db(&conn).expect("schema init");
    conn
}
