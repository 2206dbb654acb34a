use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_core::Identifier;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, error, instrument};

use crate::error::{Result, SchedulerError};
use crate::repository::{ScheduleRepository, SnapshotRepository};
use crate::types::{FixedRate, FixedRateUnit, SchedulableEntity, ScheduleExpression};

/// Initialise the scheduler schema in `conn`.
///
/// Safe to call on every startup, uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedulable_entities (
            project                 TEXT    NOT NULL,
            domain                  TEXT    NOT NULL,
            name                    TEXT    NOT NULL,
            version                 TEXT    NOT NULL,
            cron_expression         TEXT,               -- NULL for fixed-rate rows
            fixed_rate_value        INTEGER,
            fixed_rate_unit         INTEGER,            -- 0 minute, 1 hour, 2 day
            kickoff_time_input_arg  TEXT    NOT NULL DEFAULT '',
            active                  INTEGER,            -- NULL treated as inactive
            created_at              TEXT    NOT NULL,
            updated_at              TEXT    NOT NULL,   -- last active/inactive flip
            PRIMARY KEY (project, domain, name, version)
        ) STRICT;

        -- Append-only; readers take the highest id.
        CREATE TABLE IF NOT EXISTS schedule_entities_snapshots (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            snapshot    BLOB    NOT NULL,
            created_at  TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

struct ScheduleRow {
    project: String,
    domain: String,
    name: String,
    version: String,
    cron_expression: Option<String>,
    fixed_rate_value: Option<i64>,
    fixed_rate_unit: Option<i32>,
    kickoff_time_input_arg: String,
    active: Option<bool>,
    created_at: String,
    updated_at: String,
}

impl ScheduleRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project: row.get(0)?,
            domain: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            cron_expression: row.get(4)?,
            fixed_rate_value: row.get(5)?,
            fixed_rate_unit: row.get(6)?,
            kickoff_time_input_arg: row.get(7)?,
            active: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_entity(self) -> Result<SchedulableEntity> {
        let expression = match (self.cron_expression, self.fixed_rate_value) {
            (Some(expression), _) if !expression.trim().is_empty() => {
                ScheduleExpression::Cron { expression }
            }
            (_, Some(value)) => ScheduleExpression::FixedRate(FixedRate {
                value: u32::try_from(value).map_err(|_| {
                    SchedulerError::InvalidSchedule(format!("fixed rate value {value} out of range"))
                })?,
                unit: FixedRateUnit::from_code(self.fixed_rate_unit.unwrap_or_default()),
            }),
            _ => {
                return Err(SchedulerError::InvalidSchedule(
                    "neither cron expression nor fixed rate set".to_string(),
                ))
            }
        };

        Ok(SchedulableEntity {
            id: Identifier {
                project: self.project,
                domain: self.domain,
                name: self.name,
                version: self.version,
            },
            expression,
            kickoff_time_input_arg: self.kickoff_time_input_arg,
            active: self.active,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::InvalidSchedule(format!("bad timestamp '{s}': {e}")))
}

/// SQLite-backed schedule and snapshot store.
///
/// Wraps a single connection in a `Mutex`; every query is short and the
/// scheduler issues at most a few per poll interval.
pub struct SqliteScheduleStore {
    db: Mutex<Connection>,
}

impl SqliteScheduleStore {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    #[instrument(skip(self))]
    fn load_schedules(&self) -> Result<Vec<SchedulableEntity>> {
        let db = self.db.lock().map_err(|_| SchedulerError::StorePoisoned)?;
        let mut stmt = db.prepare_cached(
            "SELECT project, domain, name, version, cron_expression, fixed_rate_value,
                    fixed_rate_unit, kickoff_time_input_arg, active, created_at, updated_at
             FROM schedulable_entities
             ORDER BY project, domain, name, version",
        )?;
        let rows: Vec<ScheduleRow> = stmt
            .query_map([], ScheduleRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in rows {
            let id = format!("{}:{}:{}:{}", row.project, row.domain, row.name, row.version);
            match row.into_entity() {
                Ok(entity) => schedules.push(entity),
                Err(e) => error!(schedule = %id, "skipping undecodable schedule row: {e}"),
            }
        }
        debug!(count = schedules.len(), "schedules loaded");
        Ok(schedules)
    }

    #[instrument(skip(self, snapshot), fields(bytes = snapshot.len()))]
    fn append_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        let db = self.db.lock().map_err(|_| SchedulerError::StorePoisoned)?;
        db.execute(
            "INSERT INTO schedule_entities_snapshots (snapshot, created_at) VALUES (?1, ?2)",
            rusqlite::params![snapshot, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn latest_snapshot(&self) -> Result<Option<Vec<u8>>> {
        let db = self.db.lock().map_err(|_| SchedulerError::StorePoisoned)?;
        let snapshot = db
            .query_row(
                "SELECT snapshot FROM schedule_entities_snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(snapshot)
    }
}

#[async_trait]
impl ScheduleRepository for SqliteScheduleStore {
    async fn list_all(&self) -> Result<Vec<SchedulableEntity>> {
        self.load_schedules()
    }
}

#[async_trait]
impl SnapshotRepository for SqliteScheduleStore {
    async fn write_latest(&self, snapshot: &[u8]) -> Result<()> {
        self.append_snapshot(snapshot)
    }

    async fn read_latest(&self) -> Result<Option<Vec<u8>>> {
        self.latest_snapshot()
    }
}
