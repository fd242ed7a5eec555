use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs`, `triggers` and `locks` tables (idempotent). Every node
/// of a cluster runs this against the same database file on startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            job_group          TEXT    NOT NULL,
            job_id             TEXT    NOT NULL,
            handler            TEXT    NOT NULL,
            job_data           TEXT    NOT NULL,   -- JSON object of string -> string
            requests_recovery  INTEGER NOT NULL DEFAULT 0,
            created_at         TEXT    NOT NULL,
            updated_at         TEXT    NOT NULL,
            PRIMARY KEY (job_group, job_id)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS triggers (
            job_group           TEXT NOT NULL,
            job_id              TEXT NOT NULL,
            cron                TEXT NOT NULL,
            state               TEXT NOT NULL DEFAULT 'waiting',
            next_fire_time      TEXT,            -- NULL once the schedule is exhausted
            previous_fire_time  TEXT,
            misfire_policy      TEXT NOT NULL DEFAULT 'fire_now',
            instance_id         TEXT,            -- owner while acquired/executing
            fired_at            TEXT,            -- scheduled time of the in-flight firing
            last_error          TEXT,
            updated_at          TEXT NOT NULL,
            PRIMARY KEY (job_group, job_id),
            FOREIGN KEY (job_group, job_id)
                REFERENCES jobs (job_group, job_id) ON DELETE CASCADE
        ) STRICT;

        -- Efficient polling: WHERE state = 'waiting' AND next_fire_time <= ?
        CREATE INDEX IF NOT EXISTS idx_triggers_due
            ON triggers (state, next_fire_time, job_group, job_id);

        CREATE TABLE IF NOT EXISTS locks (
            name         TEXT NOT NULL PRIMARY KEY,
            owner        TEXT NOT NULL,
            acquired_at  TEXT NOT NULL,
            expires_at   TEXT NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
