//! SQLite-backed source for the runtime flag snapshot.

use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::Connection;

use switchboard_core::error::SwitchboardError;
use switchboard_core::flags::FlagSource;

use crate::db::init_db;
use crate::error::Result;

pub struct SqliteFlagSource {
    db: Mutex<Connection>,
}

impl SqliteFlagSource {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::new(conn)
    }

    /// Operator-facing setter; the serving side picks it up on the next
    /// snapshot refresh.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO flags (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }
}

impl FlagSource for SqliteFlagSource {
    fn load(&self) -> switchboard_core::error::Result<HashMap<String, String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db
            .prepare("SELECT key, value FROM flags")
            .map_err(|e| SwitchboardError::Store(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| SwitchboardError::Store(e.to_string()))?;
        let mut values = HashMap::new();
        for row in rows {
            let (key, value) = row.map_err(|e| SwitchboardError::Store(e.to_string()))?;
            values.insert(key, value);
        }
        Ok(values)
    }
}
