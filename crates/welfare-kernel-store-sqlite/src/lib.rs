use std::fmt::{Display, Formatter};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;
use welfare_kernel_core::{EvaluationReport, QuestionId};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  anonymous_key TEXT NOT NULL UNIQUE,
  name_ciphertext TEXT NOT NULL,
  birth_year INTEGER NOT NULL CHECK (birth_year >= 1800),
  region TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS survey_responses (
  response_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  question_id INTEGER NOT NULL CHECK (question_id BETWEEN 1 AND 5),
  answer TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (user_id, question_id),
  FOREIGN KEY (user_id) REFERENCES users(user_id)
);

CREATE TABLE IF NOT EXISTS evaluations (
  evaluation_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  generated_at TEXT NOT NULL,
  report_json TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES users(user_id)
);

CREATE INDEX IF NOT EXISTS idx_survey_responses_user ON survey_responses(user_id);
CREATE INDEX IF NOT EXISTS idx_evaluations_user ON evaluations(user_id, generated_at);
";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserId(pub Ulid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One registered survey participant. The display name is stored only as
/// ciphertext; the anonymous key is the participant's lookup handle.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserRow {
    pub user_id: UserId,
    pub anonymous_key: String,
    pub name_ciphertext: String,
    pub birth_year: i32,
    pub region: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a SQLite-backed survey store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Persist one registered user.
    ///
    /// # Errors
    /// Returns an error when the insert fails, including anonymous-key collisions.
    pub fn create_user(&mut self, user: &UserRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO users(user_id, anonymous_key, name_ciphertext, birth_year, region, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user.user_id.to_string(),
                    user.anonymous_key,
                    user.name_ciphertext,
                    i64::from(user.birth_year),
                    user.region,
                    rfc3339(user.created_at)?,
                ],
            )
            .context("failed to insert user")?;
        Ok(())
    }

    /// Look up a registered user by their anonymous key.
    ///
    /// # Errors
    /// Returns an error when the lookup query or row decoding fails.
    pub fn find_user_by_key(&self, anonymous_key: &str) -> Result<Option<UserRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, anonymous_key, name_ciphertext, birth_year, region, created_at
             FROM users
             WHERE anonymous_key = ?1",
        )?;
        let row = stmt
            .query_row(params![anonymous_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .optional()?;

        match row {
            Some((user_id, anonymous_key, name_ciphertext, birth_year, region, created_at)) => {
                Ok(Some(UserRow {
                    user_id: parse_user_id(&user_id)?,
                    anonymous_key,
                    name_ciphertext,
                    birth_year: i32::try_from(birth_year)
                        .with_context(|| format!("birth_year out of range: {birth_year}"))?,
                    region,
                    created_at: parse_rfc3339(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Store one survey answer, replacing any previous answer for the same
    /// question. Resubmission is routine during a survey session, so this is
    /// delete-then-insert inside one transaction.
    ///
    /// # Errors
    /// Returns an error when either write in the transaction fails.
    pub fn upsert_answer(
        &mut self,
        user_id: UserId,
        question: QuestionId,
        raw_answer: &str,
    ) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start answer transaction")?;

        tx.execute(
            "DELETE FROM survey_responses WHERE user_id = ?1 AND question_id = ?2",
            params![user_id.to_string(), i64::from(question.get())],
        )
        .context("failed to clear previous answer")?;

        tx.execute(
            "INSERT INTO survey_responses(response_id, user_id, question_id, answer, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Ulid::new().to_string(),
                user_id.to_string(),
                i64::from(question.get()),
                raw_answer,
                now_rfc3339()?,
            ],
        )
        .context("failed to insert survey answer")?;

        tx.commit().context("failed to commit answer transaction")?;
        Ok(())
    }

    /// Load one user's raw answers ordered by question id, as
    /// (`question_id`, `raw_answer`) pairs ready for the engine.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_answers(&self, user_id: UserId) -> Result<Vec<(u8, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT question_id, answer FROM survey_responses
             WHERE user_id = ?1
             ORDER BY question_id ASC",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut answers = Vec::new();
        for row in rows {
            let (question_id, answer) = row?;
            let question_id = u8::try_from(question_id)
                .with_context(|| format!("question_id out of range: {question_id}"))?;
            answers.push((question_id, answer));
        }

        Ok(answers)
    }

    /// Persist one evaluation report for a user.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn save_evaluation(&mut self, user_id: UserId, report: &EvaluationReport) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO evaluations(evaluation_id, user_id, generated_at, report_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    report.evaluation_id,
                    user_id.to_string(),
                    rfc3339(report.generated_at)?,
                    serde_json::to_string(report)
                        .context("failed to serialize evaluation report")?,
                ],
            )
            .context("failed to persist evaluation report")?;
        Ok(())
    }

    /// Fetch the most recent evaluation report stored for a user.
    ///
    /// # Errors
    /// Returns an error when the lookup or JSON deserialization fails.
    pub fn latest_evaluation(&self, user_id: UserId) -> Result<Option<EvaluationReport>> {
        let mut stmt = self.conn.prepare(
            "SELECT report_json FROM evaluations
             WHERE user_id = ?1
             ORDER BY generated_at DESC, evaluation_id DESC
             LIMIT 1",
        )?;
        let value = stmt
            .query_row(params![user_id.to_string()], |row| row.get::<_, String>(0))
            .optional()?;

        match value {
            Some(json) => {
                let report = serde_json::from_str(&json)
                    .context("failed to deserialize stored evaluation report")?;
                Ok(Some(report))
            }
            None => Ok(None),
        }
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_user_id(raw: &str) -> Result<UserId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(UserId(parsed))
}
