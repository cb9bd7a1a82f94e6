//! Connection tuning shared by every SQLite handle the projector opens

use rusqlite::Connection;
use std::time::Duration;

/// Busy timeout before a locked database surfaces as an error
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply WAL journaling and the durability/caching settings the view store expects.
///
/// `synchronous = NORMAL` under WAL still makes every committed transaction
/// durable against process crashes, which is what offset acknowledgement relies on.
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    log::debug!("SQLite journal_mode={}", mode);

    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_pragmas_enable_wal() {
        let temp = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp.path()).unwrap();

        apply_optimized_pragmas(&conn).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
