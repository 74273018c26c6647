//! SQLite-backed job store.
//!
//! `VigilDb` owns the connection and exposes synchronous operations;
//! `SqliteStore` wraps it behind `Arc<Mutex>` and runs every access on
//! tokio's blocking pool via `spawn_blocking`, keeping synchronous SQLite
//! I/O off the async worker threads. The single connection mutex also
//! serializes the read-check-write sequences (`record_approval`) so the
//! optimistic preconditions hold without SQL-level transactions.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{JobFilter, JobStore};
use crate::errors::StoreError;
use crate::models::{
    AnalysisJob, HistoryEntry, HumanApproval, JobStage, JobStatus, Project, ProjectScanConfig,
    ScanCadence, Severity, TriggerSource,
};

const JOB_COLUMNS: &str = "id, project_id, user_id, commit_ref, status, stage, progress, \
     vulnerabilities, security_score, threat_level, threat_model, proposed_actions, approval, \
     remediation_results, previous_job_id, triggered_by, changed_files, analysis_errors, error, \
     created_at, started_at, completed_at, failed_at";

fn sql_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |e| StoreError::Database(anyhow::Error::new(e).context(context))
}

fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value)
        .map_err(|e| StoreError::Database(anyhow::Error::new(e).context("Failed to encode column")))
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw)
        .map_err(|e| StoreError::Database(anyhow::Error::new(e).context("Failed to decode column")))
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            StoreError::Database(anyhow::Error::new(e).context("Invalid timestamp in database"))
        })
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|e: String| StoreError::Database(anyhow::anyhow!(e)))
}

/// Raw job row, converted into the domain type after the rusqlite mapping
/// closure so parse failures surface as `StoreError` instead of panics.
struct JobRow {
    id: String,
    project_id: String,
    user_id: Option<String>,
    commit_ref: String,
    status: String,
    stage: Option<String>,
    progress: u8,
    vulnerabilities: String,
    security_score: Option<u8>,
    threat_level: Option<String>,
    threat_model: Option<String>,
    proposed_actions: String,
    approval: Option<String>,
    remediation_results: String,
    previous_job_id: Option<String>,
    triggered_by: String,
    changed_files: Option<String>,
    analysis_errors: u32,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    failed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            user_id: row.get(2)?,
            commit_ref: row.get(3)?,
            status: row.get(4)?,
            stage: row.get(5)?,
            progress: row.get(6)?,
            vulnerabilities: row.get(7)?,
            security_score: row.get(8)?,
            threat_level: row.get(9)?,
            threat_model: row.get(10)?,
            proposed_actions: row.get(11)?,
            approval: row.get(12)?,
            remediation_results: row.get(13)?,
            previous_job_id: row.get(14)?,
            triggered_by: row.get(15)?,
            changed_files: row.get(16)?,
            analysis_errors: row.get(17)?,
            error: row.get(18)?,
            created_at: row.get(19)?,
            started_at: row.get(20)?,
            completed_at: row.get(21)?,
            failed_at: row.get(22)?,
        })
    }

    fn into_job(self) -> Result<AnalysisJob, StoreError> {
        Ok(AnalysisJob {
            status: parse_enum::<JobStatus>(&self.status)?,
            stage: self.stage.as_deref().map(parse_enum::<JobStage>).transpose()?,
            vulnerabilities: decode(&self.vulnerabilities)?,
            threat_level: self
                .threat_level
                .as_deref()
                .map(parse_enum::<Severity>)
                .transpose()?,
            threat_model: self.threat_model.as_deref().map(decode).transpose()?,
            proposed_actions: decode(&self.proposed_actions)?,
            approval: self.approval.as_deref().map(decode).transpose()?,
            remediation_results: decode(&self.remediation_results)?,
            triggered_by: parse_enum::<TriggerSource>(&self.triggered_by)?,
            changed_files: self.changed_files.as_deref().map(decode).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            failed_at: parse_opt_ts(self.failed_at)?,
            id: self.id,
            project_id: self.project_id,
            user_id: self.user_id,
            commit_ref: self.commit_ref,
            progress: self.progress,
            security_score: self.security_score,
            previous_job_id: self.previous_job_id,
            analysis_errors: self.analysis_errors,
            error: self.error,
        })
    }
}

struct HistoryRow {
    job_id: String,
    project_id: String,
    recorded_at: String,
    security_score: u8,
    threat_level: String,
    new_vulnerabilities: u32,
    resolved_vulnerabilities: u32,
    triggered_by: String,
}

impl HistoryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            project_id: row.get(1)?,
            recorded_at: row.get(2)?,
            security_score: row.get(3)?,
            threat_level: row.get(4)?,
            new_vulnerabilities: row.get(5)?,
            resolved_vulnerabilities: row.get(6)?,
            triggered_by: row.get(7)?,
        })
    }

    fn into_entry(self) -> Result<HistoryEntry, StoreError> {
        Ok(HistoryEntry {
            recorded_at: parse_ts(&self.recorded_at)?,
            threat_level: parse_enum::<Severity>(&self.threat_level)?,
            triggered_by: parse_enum::<TriggerSource>(&self.triggered_by)?,
            job_id: self.job_id,
            project_id: self.project_id,
            security_score: self.security_score,
            new_vulnerabilities: self.new_vulnerabilities,
            resolved_vulnerabilities: self.resolved_vulnerabilities,
        })
    }
}

pub struct VigilDb {
    conn: Connection,
}

impl VigilDb {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(sql_err("Failed to open SQLite database"))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(sql_err("Failed to open in-memory SQLite database"))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(sql_err("Failed to enable foreign keys"))?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    repo_path TEXT NOT NULL,
                    default_branch TEXT NOT NULL DEFAULT 'main',
                    webhook_secret TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS scan_configs (
                    project_id TEXT PRIMARY KEY,
                    cadence TEXT NOT NULL,
                    last_scan_at TEXT,
                    owner TEXT NOT NULL DEFAULT ''
                );

                -- jobs and scan_configs keep plain project_id columns: job
                -- rows outlive removed project records.
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    user_id TEXT,
                    commit_ref TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    stage TEXT,
                    progress INTEGER NOT NULL DEFAULT 0,
                    vulnerabilities TEXT NOT NULL DEFAULT '[]',
                    security_score INTEGER,
                    threat_level TEXT,
                    threat_model TEXT,
                    proposed_actions TEXT NOT NULL DEFAULT '[]',
                    approval TEXT,
                    remediation_results TEXT NOT NULL DEFAULT '[]',
                    previous_job_id TEXT,
                    triggered_by TEXT NOT NULL,
                    changed_files TEXT,
                    analysis_errors INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    failed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS job_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    project_id TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    security_score INTEGER NOT NULL,
                    threat_level TEXT NOT NULL,
                    new_vulnerabilities INTEGER NOT NULL,
                    resolved_vulnerabilities INTEGER NOT NULL,
                    triggered_by TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(project_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_history_project ON job_history(project_id);
                CREATE INDEX IF NOT EXISTS idx_history_recorded ON job_history(recorded_at);
                ",
            )
            .map_err(sql_err("Failed to run migrations"))?;
        Ok(())
    }

    pub fn create_project(&self, project: &Project) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO projects (id, name, repo_path, default_branch, webhook_secret, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    project.id,
                    project.name,
                    project.repo_path,
                    project.default_branch,
                    project.webhook_secret,
                    project.created_at.to_rfc3339(),
                ],
            )
            .map_err(sql_err("Failed to insert project"))?;
        Ok(())
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, name, repo_path, default_branch, webhook_secret, created_at
                 FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err("Failed to query project"))?
            .map(|(id, name, repo_path, default_branch, webhook_secret, created_at)| {
                Ok(Project {
                    id,
                    name,
                    repo_path,
                    default_branch,
                    webhook_secret,
                    created_at: parse_ts(&created_at)?,
                })
            })
            .transpose()
    }

    pub fn upsert_scan_config(&self, config: &ProjectScanConfig) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO scan_configs (project_id, cadence, last_scan_at, owner)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(project_id) DO UPDATE SET cadence = ?2, owner = ?4",
                params![
                    config.project_id,
                    config.cadence.as_str(),
                    config.last_scan_at.map(|t| t.to_rfc3339()),
                    config.owner,
                ],
            )
            .map_err(sql_err("Failed to upsert scan config"))?;
        Ok(())
    }

    pub fn create_job(&self, job: &AnalysisJob) -> Result<(), StoreError> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                      ?17, ?18, ?19, ?20, ?21, ?22, ?23)"
                ),
                params![
                    job.id,
                    job.project_id,
                    job.user_id,
                    job.commit_ref,
                    job.status.as_str(),
                    job.stage.map(|s| s.as_str()),
                    job.progress,
                    encode(&job.vulnerabilities)?,
                    job.security_score,
                    job.threat_level.map(|s| s.as_str()),
                    job.threat_model.as_ref().map(encode).transpose()?,
                    encode(&job.proposed_actions)?,
                    job.approval.as_ref().map(encode).transpose()?,
                    encode(&job.remediation_results)?,
                    job.previous_job_id,
                    job.triggered_by.as_str(),
                    job.changed_files.as_ref().map(encode).transpose()?,
                    job.analysis_errors,
                    job.error,
                    job.created_at.to_rfc3339(),
                    job.started_at.map(|t| t.to_rfc3339()),
                    job.completed_at.map(|t| t.to_rfc3339()),
                    job.failed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(sql_err("Failed to insert job"))?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<AnalysisJob>, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                JobRow::from_row,
            )
            .optional()
            .map_err(sql_err("Failed to query job"))?
            .map(JobRow::into_job)
            .transpose()
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<AnalysisJob>, StoreError> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(ref project_id) = filter.project_id {
            clauses.push("project_id = ?");
            values.push(project_id.clone());
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(status.as_str().to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(sql_err("Failed to prepare job listing"))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), JobRow::from_row)
            .map_err(sql_err("Failed to list jobs"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err("Failed to read job row"))?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    pub fn find_active_job(&self, project_id: &str) -> Result<Option<AnalysisJob>, StoreError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE project_id = ?1 AND status IN ('pending', 'in_progress')
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![project_id],
                JobRow::from_row,
            )
            .optional()
            .map_err(sql_err("Failed to query active job"))?
            .map(JobRow::into_job)
            .transpose()
    }

    pub fn latest_completed_job(
        &self,
        project_id: &str,
    ) -> Result<Option<AnalysisJob>, StoreError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE project_id = ?1 AND status = 'completed'
                     ORDER BY completed_at DESC LIMIT 1"
                ),
                params![project_id],
                JobRow::from_row,
            )
            .optional()
            .map_err(sql_err("Failed to query latest completed job"))?
            .map(JobRow::into_job)
            .transpose()
    }

    /// CAS pending -> in_progress. One winner per job, enforced by the
    /// guarded UPDATE's row count.
    pub fn claim_job(&self, id: &str, started_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'in_progress', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, started_at.to_rfc3339()],
            )
            .map_err(sql_err("Failed to claim job"))?;
        Ok(changed == 1)
    }

    pub fn update_stage(&self, id: &str, stage: JobStage) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET stage = ?2, progress = MAX(progress, ?3)
                 WHERE id = ?1 AND status = 'in_progress'",
                params![id, stage.as_str(), stage.progress()],
            )
            .map_err(sql_err("Failed to update stage"))?;
        if changed == 0 {
            return Err(StoreError::Conflict {
                message: format!("job {} is not in progress", id),
            });
        }
        Ok(())
    }

    /// Full-state write, rejected once the job reached completed/failed so a
    /// terminal row can never be mutated again.
    pub fn save_job(&self, job: &AnalysisJob) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET
                     status = ?2, stage = ?3, progress = MAX(progress, ?4),
                     vulnerabilities = ?5, security_score = ?6, threat_level = ?7,
                     threat_model = ?8, proposed_actions = ?9, approval = ?10,
                     remediation_results = ?11, previous_job_id = ?12, analysis_errors = ?13,
                     error = ?14, started_at = ?15, completed_at = ?16, failed_at = ?17
                 WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
                params![
                    job.id,
                    job.status.as_str(),
                    job.stage.map(|s| s.as_str()),
                    job.progress,
                    encode(&job.vulnerabilities)?,
                    job.security_score,
                    job.threat_level.map(|s| s.as_str()),
                    job.threat_model.as_ref().map(encode).transpose()?,
                    encode(&job.proposed_actions)?,
                    job.approval.as_ref().map(encode).transpose()?,
                    encode(&job.remediation_results)?,
                    job.previous_job_id,
                    job.analysis_errors,
                    job.error,
                    job.started_at.map(|t| t.to_rfc3339()),
                    job.completed_at.map(|t| t.to_rfc3339()),
                    job.failed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(sql_err("Failed to save job"))?;
        if changed == 0 {
            return Err(StoreError::Conflict {
                message: format!("job {} is terminal or missing", job.id),
            });
        }
        Ok(())
    }

    pub fn record_approval(
        &self,
        job_id: &str,
        approval: &HumanApproval,
    ) -> Result<(), StoreError> {
        let stored: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT approval FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err("Failed to query approval"))?;
        let Some(stored) = stored else {
            return Err(StoreError::JobNotFound {
                id: job_id.to_string(),
            });
        };
        let Some(raw) = stored else {
            return Err(StoreError::Conflict {
                message: format!("job {} has no approval gate", job_id),
            });
        };
        let current: HumanApproval = decode(&raw)?;
        if current.status != crate::models::ApprovalStatus::Pending {
            return Err(StoreError::Conflict {
                message: format!("approval for job {} already decided", job_id),
            });
        }

        self.conn
            .execute(
                "UPDATE jobs SET approval = ?2 WHERE id = ?1",
                params![job_id, encode(approval)?],
            )
            .map_err(sql_err("Failed to record approval"))?;
        Ok(())
    }

    pub fn append_history(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO job_history
                     (job_id, project_id, recorded_at, security_score, threat_level,
                      new_vulnerabilities, resolved_vulnerabilities, triggered_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.job_id,
                    entry.project_id,
                    entry.recorded_at.to_rfc3339(),
                    entry.security_score,
                    entry.threat_level.as_str(),
                    entry.new_vulnerabilities,
                    entry.resolved_vulnerabilities,
                    entry.triggered_by.as_str(),
                ],
            )
            .map_err(sql_err("Failed to append history"))?;
        Ok(())
    }

    pub fn history_for_job(&self, job_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT job_id, project_id, recorded_at, security_score, threat_level,
                        new_vulnerabilities, resolved_vulnerabilities, triggered_by
                 FROM job_history WHERE job_id = ?1 ORDER BY recorded_at",
            )
            .map_err(sql_err("Failed to prepare history query"))?;
        let rows = stmt
            .query_map(params![job_id], HistoryRow::from_row)
            .map_err(sql_err("Failed to query job history"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err("Failed to read history row"))?;
        rows.into_iter().map(HistoryRow::into_entry).collect()
    }

    pub fn history_for_project(
        &self,
        project_id: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let (sql, values): (&str, Vec<String>) = match range {
            Some((from, to)) => (
                "SELECT job_id, project_id, recorded_at, security_score, threat_level,
                        new_vulnerabilities, resolved_vulnerabilities, triggered_by
                 FROM job_history
                 WHERE project_id = ?1 AND recorded_at >= ?2 AND recorded_at <= ?3
                 ORDER BY recorded_at",
                vec![project_id.to_string(), from.to_rfc3339(), to.to_rfc3339()],
            ),
            None => (
                "SELECT job_id, project_id, recorded_at, security_score, threat_level,
                        new_vulnerabilities, resolved_vulnerabilities, triggered_by
                 FROM job_history WHERE project_id = ?1 ORDER BY recorded_at",
                vec![project_id.to_string()],
            ),
        };
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(sql_err("Failed to prepare history query"))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), HistoryRow::from_row)
            .map_err(sql_err("Failed to query project history"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err("Failed to read history row"))?;
        rows.into_iter().map(HistoryRow::into_entry).collect()
    }

    pub fn scan_configs_by_cadence(
        &self,
        cadence: ScanCadence,
    ) -> Result<Vec<ProjectScanConfig>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT project_id, cadence, last_scan_at, owner
                 FROM scan_configs WHERE cadence = ?1 ORDER BY project_id",
            )
            .map_err(sql_err("Failed to prepare scan config query"))?;
        let rows = stmt
            .query_map(params![cadence.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(sql_err("Failed to query scan configs"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err("Failed to read scan config row"))?;
        rows.into_iter()
            .map(|(project_id, cadence, last_scan_at, owner)| {
                Ok(ProjectScanConfig {
                    project_id,
                    cadence: parse_enum::<ScanCadence>(&cadence)?,
                    last_scan_at: parse_opt_ts(last_scan_at)?,
                    owner,
                })
            })
            .collect()
    }

    pub fn scan_config_for_project(
        &self,
        project_id: &str,
    ) -> Result<Option<ProjectScanConfig>, StoreError> {
        self.conn
            .query_row(
                "SELECT project_id, cadence, last_scan_at, owner
                 FROM scan_configs WHERE project_id = ?1",
                params![project_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err("Failed to query scan config"))?
            .map(|(project_id, cadence, last_scan_at, owner)| {
                Ok(ProjectScanConfig {
                    project_id,
                    cadence: parse_enum::<ScanCadence>(&cadence)?,
                    last_scan_at: parse_opt_ts(last_scan_at)?,
                    owner,
                })
            })
            .transpose()
    }

    pub fn touch_last_scan(
        &self,
        project_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE scan_configs SET last_scan_at = ?2 WHERE project_id = ?1",
                params![project_id, at.to_rfc3339()],
            )
            .map_err(sql_err("Failed to update last scan time"))?;
        Ok(())
    }
}

/// Async-safe handle implementing the `JobStore` seam over `VigilDb`.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Mutex<VigilDb>>,
}

impl SqliteStore {
    pub fn new(db: VigilDb) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(VigilDb::new(path)?))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(VigilDb::new_in_memory()?))
    }

    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&VigilDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| StoreError::Database(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Database(anyhow::anyhow!("DB task panicked: {}", e)))?
    }

    /// Seed helper for startup and tests; admin CRUD is not part of the
    /// `JobStore` seam.
    pub async fn add_project(
        &self,
        project: Project,
        config: Option<ProjectScanConfig>,
    ) -> Result<(), StoreError> {
        self.call(move |db| {
            db.create_project(&project)?;
            if let Some(config) = config {
                db.upsert_scan_config(&config)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn add_scan_config(&self, config: ProjectScanConfig) -> Result<(), StoreError> {
        self.call(move |db| db.upsert_scan_config(&config)).await
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn get_project(&self, id: &str) -> Result<Option<Project>, StoreError> {
        let id = id.to_string();
        self.call(move |db| db.get_project(&id)).await
    }

    async fn create_job(&self, job: &AnalysisJob) -> Result<(), StoreError> {
        let job = job.clone();
        self.call(move |db| db.create_job(&job)).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<AnalysisJob>, StoreError> {
        let id = id.to_string();
        self.call(move |db| db.get_job(&id)).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<AnalysisJob>, StoreError> {
        let filter = filter.clone();
        self.call(move |db| db.list_jobs(&filter)).await
    }

    async fn find_active_job(&self, project_id: &str) -> Result<Option<AnalysisJob>, StoreError> {
        let project_id = project_id.to_string();
        self.call(move |db| db.find_active_job(&project_id)).await
    }

    async fn latest_completed_job(
        &self,
        project_id: &str,
    ) -> Result<Option<AnalysisJob>, StoreError> {
        let project_id = project_id.to_string();
        self.call(move |db| db.latest_completed_job(&project_id))
            .await
    }

    async fn claim_job(&self, id: &str, started_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.call(move |db| db.claim_job(&id, started_at)).await
    }

    async fn update_stage(&self, id: &str, stage: JobStage) -> Result<(), StoreError> {
        let id = id.to_string();
        self.call(move |db| db.update_stage(&id, stage)).await
    }

    async fn save_job(&self, job: &AnalysisJob) -> Result<(), StoreError> {
        let job = job.clone();
        self.call(move |db| db.save_job(&job)).await
    }

    async fn record_approval(
        &self,
        job_id: &str,
        approval: &HumanApproval,
    ) -> Result<(), StoreError> {
        let job_id = job_id.to_string();
        let approval = approval.clone();
        self.call(move |db| db.record_approval(&job_id, &approval))
            .await
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        let entry = entry.clone();
        self.call(move |db| db.append_history(&entry)).await
    }

    async fn history_for_job(&self, job_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let job_id = job_id.to_string();
        self.call(move |db| db.history_for_job(&job_id)).await
    }

    async fn history_for_project(
        &self,
        project_id: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let project_id = project_id.to_string();
        self.call(move |db| db.history_for_project(&project_id, range))
            .await
    }

    async fn scan_configs_by_cadence(
        &self,
        cadence: ScanCadence,
    ) -> Result<Vec<ProjectScanConfig>, StoreError> {
        self.call(move |db| db.scan_configs_by_cadence(cadence))
            .await
    }

    async fn scan_config_for_project(
        &self,
        project_id: &str,
    ) -> Result<Option<ProjectScanConfig>, StoreError> {
        let project_id = project_id.to_string();
        self.call(move |db| db.scan_config_for_project(&project_id))
            .await
    }

    async fn touch_last_scan(
        &self,
        project_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let project_id = project_id.to_string();
        self.call(move |db| db.touch_last_scan(&project_id, at))
            .await
    }
}
