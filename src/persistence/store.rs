//! SQLite-based persistence store

use crate::core::{Run, RunId, RunStatus, Stage, StageKind, StageStatus, StageUpdate};
use crate::persistence::{AccessStore, Group, RunStore, StoreError, StoreResult, User};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        app_id TEXT NOT NULL,
        status TEXT NOT NULL,
        triggered_by TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_runs_app_created ON runs(app_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS stages (
        run_id INTEGER NOT NULL REFERENCES runs(id),
        kind TEXT NOT NULL,
        position INTEGER NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT,
        exit_code INTEGER,
        output TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (run_id, kind)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_groups (
        user_id INTEGER NOT NULL REFERENCES users(id),
        group_id INTEGER NOT NULL REFERENCES groups(id),
        PRIMARY KEY (user_id, group_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS app_groups (
        app_id TEXT NOT NULL,
        group_id INTEGER NOT NULL REFERENCES groups(id),
        PRIMARY KEY (app_id, group_id)
    )
    "#,
];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let unique_violation = err
            .as_database_error()
            .is_some_and(|db| db.is_unique_violation());
        if unique_violation {
            StoreError::Conflict(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

/// SQLite run store
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Open (creating if missing) the database at `db_path`; `:memory:` opens a private
    /// in-memory database
    pub async fn new(db_path: &str) -> StoreResult<Self> {
        let pool = if db_path == ":memory:" {
            // One long-lived connection, otherwise every connection sees its own database
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
                .await?
        } else {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                }
            }
            let options = SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await?
        };

        let store = Self { pool };
        store.init().await?;
        debug!("Opened run store at {}", db_path);

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> StoreResult<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_path = data_dir.join("piaflow").join("piaflow.db");
        Self::new(&db_path.to_string_lossy()).await
    }

    /// Initialize database schema
    async fn init(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn parse_column<T: FromStr<Err = String>>(row: &SqliteRow, column: &str) -> StoreResult<T> {
        let raw: String = row.try_get(column)?;
        raw.parse().map_err(StoreError::Unavailable)
    }

    fn run_from_row(row: &SqliteRow) -> StoreResult<Run> {
        Ok(Run {
            id: row.try_get("id")?,
            app_id: row.try_get("app_id")?,
            status: Self::parse_column(row, "status")?,
            triggered_by: row.try_get("triggered_by")?,
            created_at: Self::from_naive(row.try_get("created_at")?),
            started_at: row
                .try_get::<Option<NaiveDateTime>, _>("started_at")?
                .map(Self::from_naive),
            finished_at: row
                .try_get::<Option<NaiveDateTime>, _>("finished_at")?
                .map(Self::from_naive),
            stages: Vec::new(),
        })
    }

    fn stage_from_row(row: &SqliteRow) -> StoreResult<Stage> {
        Ok(Stage {
            kind: Self::parse_column::<StageKind>(row, "kind")?,
            status: Self::parse_column::<StageStatus>(row, "status")?,
            started_at: row
                .try_get::<Option<NaiveDateTime>, _>("started_at")?
                .map(Self::from_naive),
            finished_at: row
                .try_get::<Option<NaiveDateTime>, _>("finished_at")?
                .map(Self::from_naive),
            exit_code: row.try_get("exit_code")?,
            output: row.try_get("output")?,
        })
    }

    async fn load_stages(&self, run_id: RunId) -> StoreResult<Vec<Stage>> {
        let rows = sqlx::query(
            r#"
            SELECT kind, status, started_at, finished_at, exit_code, output
            FROM stages
            WHERE run_id = ?1
            ORDER BY position ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::stage_from_row).collect()
    }

    async fn run_exists(&self, run_id: RunId) -> StoreResult<bool> {
        let row = sqlx::query("SELECT 1 FROM runs WHERE id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait::async_trait]
impl RunStore for SqliteRunStore {
    async fn create_run(&self, app_id: &str, triggered_by: Option<&str>) -> StoreResult<RunId> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (app_id, status, triggered_by, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(app_id)
        .bind(RunStatus::Pending.as_str())
        .bind(triggered_by)
        .bind(Self::to_naive(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn mark_running(&self, run_id: RunId) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?1, started_at = COALESCE(started_at, ?2)
            WHERE id = ?3 AND status IN ('pending', 'running')
            "#,
        )
        .bind(RunStatus::Running.as_str())
        .bind(Self::to_naive(Utc::now()))
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(if self.run_exists(run_id).await? {
                StoreError::AlreadyFinished(run_id)
            } else {
                StoreError::NotFound(run_id)
            });
        }
        Ok(())
    }

    async fn update_stage(&self, run_id: RunId, update: &StageUpdate) -> StoreResult<()> {
        // A single upsert statement, so a stage row is replaced as a whole
        sqlx::query(
            r#"
            INSERT INTO stages (run_id, kind, position, status, started_at, finished_at, exit_code, output)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (run_id, kind) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                exit_code = excluded.exit_code,
                output = excluded.output
            "#,
        )
        .bind(run_id)
        .bind(update.kind.as_str())
        .bind(update.kind.position())
        .bind(update.status.as_str())
        .bind(update.started_at.map(Self::to_naive))
        .bind(update.finished_at.map(Self::to_naive))
        .bind(update.exit_code)
        .bind(&update.output)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finalize_run(&self, run_id: RunId, status: RunStatus) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?1, finished_at = ?2
            WHERE id = ?3 AND status IN ('pending', 'running')
            "#,
        )
        .bind(status.as_str())
        .bind(Self::to_naive(Utc::now()))
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(if self.run_exists(run_id).await? {
                StoreError::AlreadyFinished(run_id)
            } else {
                StoreError::NotFound(run_id)
            });
        }
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> StoreResult<Option<Run>> {
        let row = sqlx::query(
            r#"
            SELECT id, app_id, status, triggered_by, created_at, started_at, finished_at
            FROM runs
            WHERE id = ?1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let mut run = Self::run_from_row(&row)?;
                run.stages = self.load_stages(run_id).await?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(&self, app_id: &str, limit: usize, offset: usize) -> StoreResult<Vec<Run>> {
        let rows = sqlx::query(
            r#"
            SELECT id, app_id, status, triggered_by, created_at, started_at, finished_at
            FROM runs
            WHERE app_id = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(app_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut run = Self::run_from_row(row)?;
            run.stages = self.load_stages(run.id).await?;
            runs.push(run);
        }
        Ok(runs)
    }
}

#[async_trait::async_trait]
impl AccessStore for SqliteRunStore {
    async fn list_groups(&self) -> StoreResult<Vec<Group>> {
        let rows = sqlx::query("SELECT id, name FROM groups ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(Group {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    async fn create_group(&self, name: &str) -> StoreResult<i64> {
        let result = sqlx::query("INSERT INTO groups (name) VALUES (?1)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_users(&self) -> StoreResult<Vec<User>> {
        let rows = sqlx::query("SELECT id, username, password_hash FROM users ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(User {
                    id: row.try_get("id")?,
                    username: row.try_get("username")?,
                    password_hash: row.try_get("password_hash")?,
                })
            })
            .collect()
    }

    async fn create_user(&self, username: &str, password_hash: &str) -> StoreResult<i64> {
        let result = sqlx::query("INSERT INTO users (username, password_hash) VALUES (?1, ?2)")
            .bind(username)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn find_user(&self, username: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query("SELECT id, username, password_hash FROM users WHERE username = ?1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(User {
                id: row.try_get("id")?,
                username: row.try_get("username")?,
                password_hash: row.try_get("password_hash")?,
            })),
            None => Ok(None),
        }
    }

    async fn update_password_hash(&self, user_id: i64, password_hash: &str) -> StoreResult<()> {
        sqlx::query("UPDATE users SET password_hash = ?1 WHERE id = ?2")
            .bind(password_hash)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_user_groups(&self, user_id: i64, group_ids: &[i64]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_groups WHERE user_id = ?1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        for group_id in group_ids {
            sqlx::query("INSERT OR IGNORE INTO user_groups (user_id, group_id) VALUES (?1, ?2)")
                .bind(user_id)
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn app_group_ids(&self, app_id: &str) -> StoreResult<Vec<i64>> {
        let rows = sqlx::query("SELECT group_id FROM app_groups WHERE app_id = ?1 ORDER BY group_id")
            .bind(app_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row.try_get::<i64, _>("group_id").map_err(StoreError::from))
            .collect()
    }

    async fn set_app_groups(&self, app_id: &str, group_ids: &[i64]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM app_groups WHERE app_id = ?1")
            .bind(app_id)
            .execute(&mut *tx)
            .await?;
        for group_id in group_ids {
            sqlx::query("INSERT OR IGNORE INTO app_groups (app_id, group_id) VALUES (?1, ?2)")
                .bind(app_id)
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
