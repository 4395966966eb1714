use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::core::job::{
    ArtifactKind, Job, JobArtifact, JobConstraints, JobEvent, JobRequirements, JobStatus,
};
use crate::core::provider::{Allocation, GpuInstance, InterconnectTier, Provider};
use crate::error::{Error, Result};

const SCHEMA_SQL: &str = r#"
-- Core jobs table: one row per submitted workload
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    owner TEXT NOT NULL DEFAULT '',
    team TEXT,
    project TEXT,
    job_type TEXT NOT NULL,
    framework TEXT NOT NULL,
    entrypoint_uri TEXT NOT NULL,
    dataset_uri TEXT NOT NULL DEFAULT '',
    execution_mode TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    gpus INTEGER NOT NULL,
    gpu_fraction REAL NOT NULL DEFAULT 1.0,
    use_mig INTEGER NOT NULL DEFAULT 0,
    mig_profile TEXT,
    max_gpus_per_node INTEGER NOT NULL DEFAULT 0,
    requires_multi_node INTEGER NOT NULL DEFAULT 0,
    gpu_memory_gb INTEGER NOT NULL DEFAULT 0,
    cpu_memory_gb INTEGER NOT NULL DEFAULT 0,
    storage_gb INTEGER NOT NULL DEFAULT 0,
    estimated_hours REAL NOT NULL DEFAULT 1.0,
    budget_usd REAL NOT NULL,
    deadline_at INTEGER,
    preferred_regions TEXT NOT NULL DEFAULT '[]',
    allow_spot INTEGER NOT NULL DEFAULT 0,
    min_reliability REAL NOT NULL DEFAULT 0.9,
    performance_weight REAL NOT NULL DEFAULT 0.0,
    locality TEXT NOT NULL DEFAULT 'prefer',
    replication TEXT NOT NULL DEFAULT 'none',
    selected_provider TEXT,
    selected_region TEXT,
    selected_backend TEXT NOT NULL DEFAULT 'vm',
    cluster_id TEXT,
    cost_running_usd REAL NOT NULL DEFAULT 0,
    cost_estimated_usd REAL,
    spec_yaml TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (unixepoch()),
    started_at INTEGER,
    finished_at INTEGER,
    last_heartbeat INTEGER,
    updated_at INTEGER NOT NULL DEFAULT (unixepoch()),
    CHECK (status IN ('pending','scheduled','provisioning','running','checkpointing',
                      'completed','failed','cancelled'))
);

-- Append-only lifecycle log
CREATE TABLE IF NOT EXISTS job_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    at INTEGER NOT NULL DEFAULT (unixepoch()),
    from_status TEXT,
    to_status TEXT NOT NULL,
    reason TEXT NOT NULL,
    meta TEXT NOT NULL DEFAULT '{}',
    FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
);

-- Scheduling decisions, immutable once written
CREATE TABLE IF NOT EXISTS allocations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    region TEXT NOT NULL,
    backend TEXT NOT NULL DEFAULT 'vm',
    instance_type TEXT NOT NULL,
    count INTEGER NOT NULL,
    spot INTEGER NOT NULL DEFAULT 0,
    price_per_hour REAL NOT NULL,
    estimated_hours REAL NOT NULL,
    estimated_cost REAL NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (unixepoch()),
    FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS job_artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    uri TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (unixepoch()),
    meta TEXT NOT NULL DEFAULT '{}',
    CHECK (kind IN ('checkpoint','log','output','metrics')),
    FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
);

-- Priced candidate cache, refreshed by the pricing worker
CREATE TABLE IF NOT EXISTS gpu_pricing (
    provider TEXT NOT NULL,
    region TEXT NOT NULL,
    instance_type TEXT NOT NULL,
    gpu_type TEXT NOT NULL,
    gpus_per_instance INTEGER NOT NULL,
    memory_per_gpu_gb INTEGER NOT NULL,
    interconnect TEXT NOT NULL DEFAULT 'standard',
    on_demand_price REAL NOT NULL,
    spot_price REAL,
    spot_availability REAL,
    interruption_rate REAL,
    last_updated INTEGER NOT NULL DEFAULT (unixepoch()),
    PRIMARY KEY (provider, region, instance_type)
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
CREATE INDEX IF NOT EXISTS idx_events_job ON job_events(job_id, id);
CREATE INDEX IF NOT EXISTS idx_allocations_job ON allocations(job_id);
CREATE INDEX IF NOT EXISTS idx_artifacts_job ON job_artifacts(job_id);
CREATE INDEX IF NOT EXISTS idx_pricing_updated ON gpu_pricing(last_updated);
"#;

/// Outcome of an atomic status transition. A lost race is not an error:
/// the caller observes the post-transition state and moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Lost(JobStatus),
}

/// Database handle for all durable control-plane state.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::persistence(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(&db_path)
            .map_err(|e| Error::persistence(format!("open {}: {e}", db_path.display())))?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Verify database connectivity.
    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ---- jobs ----

    /// Insert a new job and append its `created` event in one transaction.
    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO jobs (
                id, name, owner, team, project, job_type, framework, entrypoint_uri,
                dataset_uri, execution_mode, status, gpus, gpu_fraction, use_mig, mig_profile,
                max_gpus_per_node, requires_multi_node, gpu_memory_gb, cpu_memory_gb,
                storage_gb, estimated_hours, budget_usd, deadline_at, preferred_regions,
                allow_spot, min_reliability, performance_weight, locality, replication,
                selected_backend, cost_running_usd, spec_yaml, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                      ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29,
                      ?30, ?31, ?32, ?33, ?34)",
            params![
                job.id,
                job.name,
                job.owner,
                job.team,
                job.project,
                job.job_type.to_string(),
                job.requirements.framework.to_string(),
                job.entrypoint_uri,
                job.requirements.dataset_uri,
                job.requirements.execution_mode.to_string(),
                job.status.to_string(),
                job.requirements.gpus,
                job.requirements.gpu_fraction,
                job.requirements.use_mig as i64,
                job.requirements.mig_profile,
                job.requirements.max_gpus_per_node,
                job.requirements.requires_multi_node as i64,
                job.requirements.gpu_memory_gb,
                job.requirements.cpu_memory_gb,
                job.requirements.storage_gb,
                job.requirements.estimated_hours,
                job.constraints.max_budget,
                job.constraints.deadline.map(|d| d.timestamp()),
                serde_json::to_string(&job.constraints.preferred_regions)?,
                job.constraints.allow_spot as i64,
                job.constraints.min_reliability,
                job.constraints.performance_weight,
                job.constraints.data_locality.to_string(),
                job.constraints.replication_policy.to_string(),
                job.selected_backend.to_string(),
                job.cost_running_usd,
                job.spec_yaml,
                job.created_at.timestamp(),
                job.updated_at.timestamp(),
            ],
        )?;
        tx.execute(
            "INSERT INTO job_events (job_id, to_status, reason, meta) VALUES (?1, ?2, ?3, ?4)",
            params![job.id, job.status.to_string(), "created", "{}"],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .optional()?;
        Ok(job)
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut jobs = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC",
                )?;
                let rows = stmt.query_map(params![status.to_string()], row_to_job)?;
                for row in rows {
                    jobs.push(row?);
                }
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM jobs ORDER BY created_at ASC, id ASC")?;
                let rows = stmt.query_map([], row_to_job)?;
                for row in rows {
                    jobs.push(row?);
                }
            }
        }
        Ok(jobs)
    }

    pub fn count_jobs_by_status(&self, status: JobStatus) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Atomically transition `job_id` from `from` to `to`, appending the
    /// event in the same transaction. Concurrent attempts are serialized
    /// here: the loser gets `Transition::Lost(observed)`.
    pub fn transition_job(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
        reason: &str,
        meta: &serde_json::Value,
    ) -> Result<Transition> {
        if !from.can_transition_to(to) {
            return Err(Error::validation(format!(
                "illegal transition {from} -> {to} for job {job_id}"
            )));
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE jobs SET status = ?1,
                    started_at = CASE WHEN ?1 = 'running' AND started_at IS NULL
                                      THEN unixepoch() ELSE started_at END,
                    finished_at = CASE WHEN ?1 IN ('completed','failed','cancelled')
                                       THEN unixepoch() ELSE finished_at END,
                    updated_at = unixepoch()
             WHERE id = ?2 AND status = ?3",
            params![to.to_string(), job_id, from.to_string()],
        )?;
        if changed == 0 {
            let observed: Option<String> = tx
                .query_row(
                    "SELECT status FROM jobs WHERE id = ?1",
                    params![job_id],
                    |row| row.get(0),
                )
                .optional()?;
            drop(tx);
            let observed = observed
                .ok_or_else(|| Error::validation(format!("job {job_id} not found")))?;
            let observed = observed
                .parse::<JobStatus>()
                .map_err(|_| Error::persistence(format!("bad status column: {observed}")))?;
            return Ok(Transition::Lost(observed));
        }
        tx.execute(
            "INSERT INTO job_events (job_id, from_status, to_status, reason, meta)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job_id,
                from.to_string(),
                to.to_string(),
                reason,
                serde_json::to_string(meta)?,
            ],
        )?;
        tx.commit()?;
        Ok(Transition::Applied)
    }

    /// Scheduler-only: persist the chosen allocations, record the
    /// selection columns, and move pending → scheduled, all in one
    /// durable transaction.
    pub fn transition_scheduled(
        &self,
        job_id: &str,
        allocations: &[Allocation],
        estimated_cost: f64,
        reason: &str,
    ) -> Result<Transition> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let selected = allocations.first();
        let changed = tx.execute(
            "UPDATE jobs SET status = 'scheduled',
                    selected_provider = ?1, selected_region = ?2,
                    cost_estimated_usd = ?3, updated_at = unixepoch()
             WHERE id = ?4 AND status = 'pending'",
            params![
                selected.map(|a| a.provider.to_string()),
                selected.map(|a| a.region.clone()),
                estimated_cost,
                job_id,
            ],
        )?;
        if changed == 0 {
            let observed: Option<String> = tx
                .query_row(
                    "SELECT status FROM jobs WHERE id = ?1",
                    params![job_id],
                    |row| row.get(0),
                )
                .optional()?;
            drop(tx);
            let observed = observed
                .ok_or_else(|| Error::validation(format!("job {job_id} not found")))?;
            let observed = observed
                .parse::<JobStatus>()
                .map_err(|_| Error::persistence(format!("bad status column: {observed}")))?;
            return Ok(Transition::Lost(observed));
        }
        for alloc in allocations {
            tx.execute(
                "INSERT INTO allocations (
                    job_id, provider, region, backend, instance_type, count,
                    spot, price_per_hour, estimated_hours, estimated_cost
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    job_id,
                    alloc.provider.to_string(),
                    alloc.region,
                    alloc.backend.to_string(),
                    alloc.instance_type,
                    alloc.count,
                    alloc.spot as i64,
                    alloc.price_per_hour,
                    alloc.estimated_hours,
                    alloc.estimated_cost,
                ],
            )?;
        }
        tx.execute(
            "INSERT INTO job_events (job_id, from_status, to_status, reason, meta)
             VALUES (?1, 'pending', 'scheduled', ?2, '{}')",
            params![job_id, reason],
        )?;
        tx.commit()?;
        Ok(Transition::Applied)
    }

    /// Append an advisory event that does not change status (budget
    /// warnings, heartbeat notes). `from == to` keeps the replayed
    /// history consistent.
    pub fn append_advisory_event(
        &self,
        job_id: &str,
        status: JobStatus,
        reason: &str,
        meta: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_events (job_id, from_status, to_status, reason, meta)
             VALUES (?1, ?2, ?2, ?3, ?4)",
            params![
                job_id,
                status.to_string(),
                reason,
                serde_json::to_string(meta)?,
            ],
        )?;
        Ok(())
    }

    pub fn events_for_job(&self, job_id: &str) -> Result<Vec<JobEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, at, from_status, to_status, reason, meta
             FROM job_events WHERE job_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![job_id], row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Cost-tracker-only writer for accrued cost.
    pub fn update_job_cost(&self, job_id: &str, running_cost: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET cost_running_usd = ?1, updated_at = unixepoch() WHERE id = ?2",
            params![running_cost, job_id],
        )?;
        Ok(())
    }

    pub fn update_heartbeat(&self, job_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET last_heartbeat = unixepoch(), updated_at = unixepoch()
             WHERE id = ?1",
            params![job_id],
        )?;
        Ok(())
    }

    /// Scheduler-only: record the cluster a job landed on.
    pub fn update_job_cluster(&self, job_id: &str, cluster_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET cluster_id = ?1, updated_at = unixepoch() WHERE id = ?2",
            params![cluster_id, job_id],
        )?;
        Ok(())
    }

    // ---- allocations ----

    pub fn allocations_for_job(&self, job_id: &str) -> Result<Vec<Allocation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT provider, region, backend, instance_type, count, spot,
                    price_per_hour, estimated_hours, estimated_cost
             FROM allocations WHERE job_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![job_id], row_to_allocation)?;
        let mut allocations = Vec::new();
        for row in rows {
            allocations.push(row?);
        }
        Ok(allocations)
    }

    // ---- artifacts ----

    pub fn insert_artifact(
        &self,
        job_id: &str,
        kind: ArtifactKind,
        uri: &str,
        meta: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_artifacts (job_id, kind, uri, meta) VALUES (?1, ?2, ?3, ?4)",
            params![job_id, kind.to_string(), uri, serde_json::to_string(meta)?],
        )?;
        Ok(())
    }

    pub fn artifacts_for_job(&self, job_id: &str) -> Result<Vec<JobArtifact>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, kind, uri, created_at, meta
             FROM job_artifacts WHERE job_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![job_id], row_to_artifact)?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row?);
        }
        Ok(artifacts)
    }

    // ---- pricing ----

    /// Upsert an on-demand pricing row. Spot columns are preserved.
    pub fn upsert_on_demand(&self, instance: &GpuInstance) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO gpu_pricing (
                provider, region, instance_type, gpu_type, gpus_per_instance,
                memory_per_gpu_gb, interconnect, on_demand_price, last_updated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, unixepoch())
            ON CONFLICT (provider, region, instance_type) DO UPDATE SET
                gpu_type = excluded.gpu_type,
                gpus_per_instance = excluded.gpus_per_instance,
                memory_per_gpu_gb = excluded.memory_per_gpu_gb,
                interconnect = excluded.interconnect,
                on_demand_price = excluded.on_demand_price,
                last_updated = unixepoch()",
            params![
                instance.provider.to_string(),
                instance.region,
                instance.instance_type,
                instance.gpu_type,
                instance.gpus_per_instance,
                instance.memory_per_gpu_gb,
                instance.interconnect.to_string(),
                instance.on_demand_price,
            ],
        )?;
        Ok(())
    }

    /// Upsert a spot (or preemptible) pricing row alongside the on-demand
    /// columns.
    pub fn upsert_spot(&self, instance: &GpuInstance) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO gpu_pricing (
                provider, region, instance_type, gpu_type, gpus_per_instance,
                memory_per_gpu_gb, interconnect, on_demand_price,
                spot_price, spot_availability, interruption_rate, last_updated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, unixepoch())
            ON CONFLICT (provider, region, instance_type) DO UPDATE SET
                spot_price = excluded.spot_price,
                spot_availability = excluded.spot_availability,
                interruption_rate = excluded.interruption_rate,
                last_updated = unixepoch()",
            params![
                instance.provider.to_string(),
                instance.region,
                instance.instance_type,
                instance.gpu_type,
                instance.gpus_per_instance,
                instance.memory_per_gpu_gb,
                instance.interconnect.to_string(),
                instance.on_demand_price,
                instance.spot_price,
                instance.spot_availability,
                instance.interruption_rate,
            ],
        )?;
        Ok(())
    }

    /// All pricing rows fresher than `window_secs`.
    pub fn fresh_instances(&self, window_secs: i64) -> Result<Vec<GpuInstance>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT provider, region, instance_type, gpu_type, gpus_per_instance,
                    memory_per_gpu_gb, interconnect, on_demand_price, spot_price,
                    spot_availability, interruption_rate, last_updated
             FROM gpu_pricing
             WHERE last_updated > unixepoch() - ?1
             ORDER BY provider, region, instance_type",
        )?;
        let rows = stmt.query_map(params![window_secs], row_to_instance)?;
        let mut instances = Vec::new();
        for row in rows {
            instances.push(row?);
        }
        Ok(instances)
    }

    /// Single-row price lookup. Returns the row even when stale; the
    /// caller decides whether to schedule a refresh.
    pub fn lookup_price(
        &self,
        provider: Provider,
        region: &str,
        instance_type: &str,
        spot: bool,
    ) -> Result<Option<(f64, DateTime<Utc>)>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(f64, Option<f64>, i64)> = conn
            .query_row(
                "SELECT on_demand_price, spot_price, last_updated
                 FROM gpu_pricing
                 WHERE provider = ?1 AND region = ?2 AND instance_type = ?3",
                params![provider.to_string(), region, instance_type],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row.map(|(on_demand, spot_price, updated)| {
            let price = match spot_price {
                Some(s) if spot && s > 0.0 => s,
                _ => on_demand,
            };
            (price, epoch_to_datetime(updated))
        }))
    }
    /// Test helper: age every pricing row by `secs`.
    #[cfg(test)]
    pub(crate) fn backdate_pricing(&self, secs: i64) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE gpu_pricing SET last_updated = last_updated - ?1",
            params![secs],
        )
        .unwrap();
    }
}

// ---- row mappers ----

fn epoch_to_datetime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

fn parse_enum<T: std::str::FromStr>(value: String, column: &str) -> rusqlite::Result<T> {
    value.parse::<T>().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("bad {column}: {value}").into(),
        )
    })
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let regions_json: String = row.get("preferred_regions")?;
    let preferred_regions: Vec<String> = serde_json::from_str(&regions_json).unwrap_or_default();
    let meta_err = |column: &str, value: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("bad {column}: {value}").into(),
        )
    };

    let selected_provider: Option<String> = row.get("selected_provider")?;
    let selected_provider = match selected_provider {
        Some(p) => Some(
            p.parse::<Provider>()
                .map_err(|_| meta_err("selected_provider", &p))?,
        ),
        None => None,
    };

    Ok(Job {
        id: row.get("id")?,
        name: row.get("name")?,
        owner: row.get("owner")?,
        team: row.get("team")?,
        project: row.get("project")?,
        job_type: parse_enum(row.get("job_type")?, "job_type")?,
        entrypoint_uri: row.get("entrypoint_uri")?,
        requirements: JobRequirements {
            gpus: row.get("gpus")?,
            gpu_fraction: row.get("gpu_fraction")?,
            use_mig: row.get::<_, i64>("use_mig")? != 0,
            mig_profile: row.get("mig_profile")?,
            max_gpus_per_node: row.get("max_gpus_per_node")?,
            requires_multi_node: row.get::<_, i64>("requires_multi_node")? != 0,
            gpu_memory_gb: row.get("gpu_memory_gb")?,
            cpu_memory_gb: row.get("cpu_memory_gb")?,
            storage_gb: row.get("storage_gb")?,
            estimated_hours: row.get("estimated_hours")?,
            framework: parse_enum(row.get("framework")?, "framework")?,
            execution_mode: parse_enum(row.get("execution_mode")?, "execution_mode")?,
            dataset_uri: row.get("dataset_uri")?,
        },
        constraints: JobConstraints {
            max_budget: row.get("budget_usd")?,
            deadline: row
                .get::<_, Option<i64>>("deadline_at")?
                .map(epoch_to_datetime),
            preferred_regions,
            allow_spot: row.get::<_, i64>("allow_spot")? != 0,
            min_reliability: row.get("min_reliability")?,
            performance_weight: row.get("performance_weight")?,
            data_locality: parse_enum(row.get("locality")?, "locality")?,
            replication_policy: parse_enum(row.get("replication")?, "replication")?,
        },
        status: parse_enum(row.get("status")?, "status")?,
        selected_provider,
        selected_region: row.get("selected_region")?,
        selected_backend: parse_enum(row.get("selected_backend")?, "selected_backend")?,
        cluster_id: row.get("cluster_id")?,
        created_at: epoch_to_datetime(row.get("created_at")?),
        started_at: row
            .get::<_, Option<i64>>("started_at")?
            .map(epoch_to_datetime),
        finished_at: row
            .get::<_, Option<i64>>("finished_at")?
            .map(epoch_to_datetime),
        last_heartbeat: row
            .get::<_, Option<i64>>("last_heartbeat")?
            .map(epoch_to_datetime),
        updated_at: epoch_to_datetime(row.get("updated_at")?),
        cost_running_usd: row.get("cost_running_usd")?,
        cost_estimated_usd: row.get("cost_estimated_usd")?,
        spec_yaml: row.get("spec_yaml")?,
    })
}

fn row_to_event(row: &Row) -> rusqlite::Result<JobEvent> {
    let from_status: Option<String> = row.get(3)?;
    let from_status = match from_status {
        Some(s) => Some(parse_enum(s, "from_status")?),
        None => None,
    };
    let meta_json: String = row.get(6)?;
    Ok(JobEvent {
        id: row.get(0)?,
        job_id: row.get(1)?,
        at: epoch_to_datetime(row.get(2)?),
        from_status,
        to_status: parse_enum(row.get(4)?, "to_status")?,
        reason: row.get(5)?,
        meta: serde_json::from_str(&meta_json).unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_allocation(row: &Row) -> rusqlite::Result<Allocation> {
    Ok(Allocation {
        provider: parse_enum(row.get(0)?, "provider")?,
        region: row.get(1)?,
        backend: parse_enum(row.get(2)?, "backend")?,
        instance_type: row.get(3)?,
        count: row.get(4)?,
        spot: row.get::<_, i64>(5)? != 0,
        price_per_hour: row.get(6)?,
        estimated_hours: row.get(7)?,
        estimated_cost: row.get(8)?,
    })
}

fn row_to_artifact(row: &Row) -> rusqlite::Result<JobArtifact> {
    let meta_json: String = row.get(5)?;
    Ok(JobArtifact {
        id: row.get(0)?,
        job_id: row.get(1)?,
        kind: parse_enum(row.get(2)?, "kind")?,
        uri: row.get(3)?,
        created_at: epoch_to_datetime(row.get(4)?),
        meta: serde_json::from_str(&meta_json).unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_instance(row: &Row) -> rusqlite::Result<GpuInstance> {
    Ok(GpuInstance {
        provider: parse_enum(row.get(0)?, "provider")?,
        region: row.get(1)?,
        instance_type: row.get(2)?,
        gpu_type: row.get(3)?,
        gpus_per_instance: row.get(4)?,
        memory_per_gpu_gb: row.get(5)?,
        interconnect: parse_enum::<InterconnectTier>(row.get(6)?, "interconnect")?,
        on_demand_price: row.get(7)?,
        spot_price: row.get(8)?,
        spot_availability: row.get(9)?,
        interruption_rate: row.get(10)?,
        last_updated: epoch_to_datetime(row.get(11)?),
    })
}
