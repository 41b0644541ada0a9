//! Migration driver for the replica's own bookkeeping tables.
//!
//! The replica carries its schema version in `"_zero.versionHistory"`
//! together with `minSafeVersion`: the oldest code version that can still
//! operate on the current file layout. Running older code against a newer
//! file is not an error we can recover from in place, so it raises
//! [`AutoResetSignal`] and the caller resyncs the replica from upstream.

use rusqlite::Connection;
use tracing::info;
use zero_core::error::AutoResetSignal;

use super::ReplicaError;

pub struct Migration {
    /// Schema version this migration produces.
    pub version: i32,
    /// Oldest code version able to read the file after this migration.
    pub min_safe_version: i32,
    pub up: fn(&Connection) -> rusqlite::Result<()>,
}

/// The bookkeeping schema. New migrations append to this list; versions
/// are contiguous from 1.
pub const REPLICA_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    min_safe_version: 1,
    up: |conn| {
        conn.execute_batch(
            r#"
            CREATE TABLE "_zero.replicationState" (
              lock INTEGER PRIMARY KEY CHECK (lock = 1),
              stateVersion TEXT NOT NULL,
              replicaVersion TEXT NOT NULL
            );
            INSERT INTO "_zero.replicationState" (lock, stateVersion, replicaVersion)
              VALUES (1, '00', '00');
            CREATE TABLE "_zero.changeLog" (
              stateVersion TEXT NOT NULL,
              pos INTEGER NOT NULL,
              change TEXT NOT NULL,
              PRIMARY KEY (stateVersion, pos)
            );
            CREATE TABLE "_zero.columnMetadata" (
              schemaName TEXT NOT NULL,
              tableName TEXT NOT NULL,
              columnName TEXT NOT NULL,
              spec TEXT NOT NULL,
              PRIMARY KEY (schemaName, tableName, columnName)
            );
            CREATE TABLE "_zero.runtimeEvents" (
              event TEXT NOT NULL,
              occurredAt TEXT NOT NULL
            );
            "#,
        )
    },
}];

/// Applies all pending migrations, or raises [`AutoResetSignal`] when the
/// file was produced by a newer schema than this code understands.
pub fn run_migrations(conn: &Connection, migrations: &[Migration]) -> Result<(), ReplicaError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS "_zero.versionHistory" (
          lock INTEGER PRIMARY KEY CHECK (lock = 1),
          schemaVersion INTEGER NOT NULL,
          minSafeVersion INTEGER NOT NULL
        );
        "#,
    )?;

    let current: Option<(i32, i32)> = conn
        .query_row(
            r#"SELECT schemaVersion, minSafeVersion FROM "_zero.versionHistory""#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map(Some)
        .or_else(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    let code_version = migrations
        .last()
        .map(|m| m.version)
        .unwrap_or(0);

    if let Some((schema_version, min_safe)) = current {
        if code_version < min_safe {
            return Err(ReplicaError::AutoReset(AutoResetSignal::new(format!(
                "replica schema v{schema_version} requires at least code v{min_safe}, running v{code_version}"
            ))));
        }
        if schema_version >= code_version {
            return Ok(());
        }
    }

    let from = current.map(|(v, _)| v).unwrap_or(0);
    for migration in migrations
        .iter()
        .filter(|m| m.version > from)
    {
        info!(version = migration.version, "migrating replica bookkeeping schema");
        conn.execute_batch("BEGIN")?;
        match (migration.up)(conn).and_then(|()| {
            conn.execute(
                r#"
                INSERT INTO "_zero.versionHistory" (lock, schemaVersion, minSafeVersion)
                  VALUES (1, ?1, ?2)
                  ON CONFLICT (lock) DO UPDATE
                    SET schemaVersion = excluded.schemaVersion,
                        minSafeVersion = excluded.minSafeVersion
                "#,
                rusqlite::params![migration.version, migration.min_safe_version],
            )
            .map(|_| ())
        }) {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(err.into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn fresh_file_migrates_to_latest() {
        let conn = mem_conn();
        run_migrations(&conn, REPLICA_MIGRATIONS).unwrap();

        let (state, replica): (String, String) = conn
            .query_row(
                r#"SELECT stateVersion, replicaVersion FROM "_zero.replicationState""#,
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(state, "00");
        assert_eq!(replica, "00");

        // Idempotent on re-run.
        run_migrations(&conn, REPLICA_MIGRATIONS).unwrap();
    }

    #[test]
    fn downgrade_below_min_safe_version_signals_reset() {
        let conn = mem_conn();
        run_migrations(&conn, REPLICA_MIGRATIONS).unwrap();
        conn.execute(
            r#"UPDATE "_zero.versionHistory" SET schemaVersion = 99, minSafeVersion = 98"#,
            [],
        )
        .unwrap();

        let err = run_migrations(&conn, REPLICA_MIGRATIONS).unwrap_err();
        assert!(matches!(err, ReplicaError::AutoReset(_)), "{err:?}");
    }
}
