//! SQLite-backed bookkeeping for workflows, tasks, files and units
//!
//! The store is the single writer of the scheduler state: every mutation
//! acquires the connection mutex and runs one transaction, so readers only
//! ever observe committed snapshots. Per-workflow files and units live in
//! their own tables (`files_<label>`, `units_<label>`); labels are
//! validated against an identifier whitelist before they are spliced into
//! any statement.

use crate::config::{validate_label, StoreConfig, WorkflowConfig};
use crate::error::{LumiflowError, Result};
use crate::models::{
    DatasetInfo, Status, TaskType, TaskUpdate, UnitSource, UpdateBatch, WorkflowInfo,
    WorkflowProgress,
};
use crate::retry::with_retry;
use crate::sizer;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Database file kept under the configured working directory.
pub const DB_FILE: &str = "lobster.db";

/// Persistent state manager for workflows, tasks, files and units.
///
/// This type is `Clone` and uses `Arc<Mutex<Connection>>` for safe use from
/// multiple cooperative tasks; all database operations acquire the mutex.
#[derive(Clone)]
pub struct UnitStore {
    conn: Arc<Mutex<Connection>>,
    uuid: String,
    failure_threshold: i64,
    skipping_threshold: i64,
}

impl UnitStore {
    /// Open (or create) the store under `config.workdir`.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let conn = Connection::open(config.workdir.join(DB_FILE))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            uuid: uuid::Uuid::new_v4().simple().to_string(),
            failure_threshold: config.failure_threshold,
            skipping_threshold: config.skipping_threshold,
        };

        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    #[cfg(test)]
    pub(crate) fn in_memory(failure_threshold: i64, skipping_threshold: i64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            uuid: uuid::Uuid::new_v4().simple().to_string(),
            failure_threshold,
            skipping_threshold,
        };

        store.init_schema()?;
        Ok(store)
    }

    /// Acquire the connection mutex, recovering from poisoning.
    ///
    /// SQLite state stays valid across a panicking holder since every
    /// mutation is transactional, so the poisoned guard is recovered.
    pub(crate) fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        match self.conn.lock() {
            Ok(guard) => Ok(guard),
            Err(poison) => {
                tracing::warn!("connection mutex was poisoned, recovering");
                Ok(poison.into_inner())
            }
        }
    }

    pub(crate) fn failure_threshold(&self) -> i64 {
        self.failure_threshold
    }

    pub(crate) fn skipping_threshold(&self) -> i64 {
        self.skipping_threshold
    }

    /// The run identity stamped on every workflow registered by this store.
    pub fn run_uuid(&self) -> &str {
        &self.uuid
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS workflows (
                cfg TEXT,
                dataset TEXT,
                empty_source INTEGER,
                events INTEGER DEFAULT 0,
                file_based INTEGER,
                global_tag TEXT,
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                units INTEGER,
                units_done INTEGER DEFAULT 0,
                units_left INTEGER DEFAULT 0,
                units_paused INTEGER DEFAULT 0,
                units_running INTEGER DEFAULT 0,
                taskruntime INTEGER DEFAULT NULL,
                tasksize INTEGER,
                label TEXT NOT NULL UNIQUE,
                masked_lumis INTEGER DEFAULT 0,
                merged INTEGER DEFAULT 0,
                path TEXT,
                pset_hash TEXT DEFAULT NULL,
                publish_label TEXT,
                release TEXT,
                uuid TEXT
            );

            CREATE TABLE IF NOT EXISTS tasks (
                bytes_bare_output INTEGER DEFAULT 0,
                bytes_output INTEGER DEFAULT 0,
                bytes_received INTEGER,
                bytes_sent INTEGER,
                cache INTEGER,
                cache_end_size INTEGER,
                cache_start_size INTEGER,
                workflow INTEGER,
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                events_read INTEGER DEFAULT 0,
                events_written INTEGER DEFAULT 0,
                exit_code INTEGER,
                failed INTEGER DEFAULT 0,
                host TEXT,
                task INTEGER,
                units INTEGER DEFAULT 0,
                units_processed INTEGER DEFAULT 0,
                limits_exceeded TEXT,
                memory_resident INTEGER,
                memory_virtual INTEGER,
                memory_swap INTEGER,
                published_file_block TEXT,
                status INTEGER DEFAULT 0,
                submissions INTEGER DEFAULT 0,
                time_submit INTEGER,
                time_transfer_in_start INTEGER,
                time_transfer_in_end INTEGER,
                time_wrapper_start INTEGER,
                time_wrapper_ready INTEGER,
                time_stage_in_end INTEGER,
                time_prologue_end INTEGER,
                time_file_requested INTEGER,
                time_file_opened INTEGER,
                time_file_processing INTEGER,
                time_processing_end INTEGER,
                time_epilogue_end INTEGER,
                time_stage_out_end INTEGER,
                time_transfer_out_start INTEGER,
                time_transfer_out_end INTEGER,
                time_retrieved INTEGER,
                time_on_worker INTEGER,
                time_total_on_worker INTEGER,
                time_cpu INTEGER,
                type INTEGER,
                workdir_footprint INTEGER,
                workdir_num_files INTEGER,
                FOREIGN KEY (workflow) REFERENCES workflows(id)
            );
            ",
        )?;

        Ok(())
    }

    /// Register a workflow: insert its row, create the per-workflow files
    /// and units tables, and bulk-insert the dataset inventory.
    ///
    /// Each configured unique parameter multiplies the logical units: every
    /// file's lumi set is inserted once per argument.
    pub fn register(
        &self,
        workflow: &WorkflowConfig,
        dataset: &DatasetInfo,
        taskruntime: Option<i64>,
    ) -> Result<()> {
        validate_label(&workflow.label)?;
        let label = &workflow.label;
        let args = workflow.argument_slots();
        let n_args = args.len() as i64;

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO workflows
                (dataset, label, path, release, global_tag, publish_label, cfg, uuid,
                 file_based, empty_source, tasksize, taskruntime, units, masked_lumis,
                 units_left, events)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                workflow.dataset_name(),
                label,
                dataset.path,
                workflow.release,
                workflow.global_tag,
                workflow.sanitized_publish_label(),
                workflow.cmssw_config,
                self.uuid,
                dataset.file_based,
                dataset.empty_source,
                dataset.tasksize,
                taskruntime,
                dataset.total_lumis * n_args,
                dataset.masked_lumis,
                dataset.total_lumis * n_args,
                dataset.total_events,
            ],
        )?;

        tx.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS files_{label} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT,
                skipped INTEGER DEFAULT 0,
                units INTEGER,
                units_done INTEGER DEFAULT 0,
                units_running INTEGER DEFAULT 0,
                events INTEGER,
                events_read INTEGER DEFAULT 0,
                bytes INTEGER DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS units_{label} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task INTEGER,
                run INTEGER,
                lumi INTEGER,
                file INTEGER,
                status INTEGER DEFAULT 0,
                failed INTEGER DEFAULT 0,
                arg TEXT,
                FOREIGN KEY (task) REFERENCES tasks(id),
                FOREIGN KEY (file) REFERENCES files_{label}(id)
            );
            "
        ))?;

        {
            let mut insert_file = tx.prepare(&format!(
                "INSERT INTO files_{label} (units, events, filename, bytes) VALUES (?1, ?2, ?3, ?4)"
            ))?;
            let mut insert_unit = tx.prepare(&format!(
                "INSERT INTO units_{label} (file, run, lumi, arg) VALUES (?1, ?2, ?3, ?4)"
            ))?;

            for file in &dataset.files {
                insert_file.execute(params![
                    file.lumis.len() as i64 * n_args,
                    file.events,
                    file.filename,
                    file.bytes,
                ])?;
                let file_id = tx.last_insert_rowid();

                for arg in &args {
                    for &(run, lumi) in &file.lumis {
                        insert_unit.execute(params![file_id, run, lumi, arg])?;
                    }
                }
            }
        }

        tx.execute_batch(&format!(
            "
            CREATE INDEX IF NOT EXISTS index_filename_{label} ON files_{label}(filename);
            CREATE INDEX IF NOT EXISTS index_events_{label} ON units_{label}(run, lumi);
            CREATE INDEX IF NOT EXISTS index_files_{label} ON units_{label}(file);
            "
        ))?;

        tx.commit()?;

        info!(
            label = %label,
            units = dataset.total_lumis * n_args,
            files = dataset.files.len(),
            "registered workflow"
        );
        Ok(())
    }

    /// Apply a set of completed-task reports.
    ///
    /// For each batch, in one transaction: the generic per-task unit status
    /// lands first, then the selective per-unit overlays, then the failure
    /// counters, then the per-file counter recomputation, then the task
    /// metric rows, and finally the per-workflow stats refresh. File
    /// counters therefore always reflect the final per-unit state.
    pub fn update_units(&self, batches: &[UpdateBatch]) -> Result<()> {
        for batch in batches {
            validate_label(&batch.label)?;
        }

        with_retry(|| {
            let mut conn = self.lock_conn()?;
            let tx = conn.transaction()?;

            for batch in batches {
                let label = &batch.label;
                let table = batch.source.table(label);

                let mut generic = Vec::new();
                let mut fails = Vec::new();

                for outcome in &batch.outcomes {
                    let failed = outcome.task.status == Status::Failed;
                    let unit_status = match batch.source {
                        // A successful merge absorbs its constituents; a
                        // failed one releases them back to SUCCESSFUL.
                        UnitSource::Tasks => {
                            if failed {
                                Status::Successful
                            } else {
                                Status::Merged
                            }
                        }
                        UnitSource::Units => {
                            if failed {
                                Status::Failed
                            } else {
                                Status::Successful
                            }
                        }
                    };
                    generic.push((unit_status, outcome.task.id));
                    if failed {
                        fails.push(outcome.task.id);
                    }
                }

                {
                    let mut stmt =
                        tx.prepare(&format!("UPDATE {table} SET status=?1 WHERE task=?2"))?;
                    for (status, task) in &generic {
                        stmt.execute(params![status, task])?;
                    }
                }

                {
                    let mut stmt =
                        tx.prepare(&format!("UPDATE {table} SET status=?1 WHERE id=?2"))?;
                    for outcome in &batch.outcomes {
                        for update in &outcome.units {
                            stmt.execute(params![update.status, update.unit])?;
                        }
                    }
                }

                if !fails.is_empty() {
                    let mut stmt =
                        tx.prepare(&format!("UPDATE {table} SET failed=failed+1 WHERE task=?1"))?;
                    for task in &fails {
                        stmt.execute(params![task])?;
                    }
                }

                let deltas: Vec<_> = batch
                    .outcomes
                    .iter()
                    .flat_map(|o| o.files.iter())
                    .collect();
                if !deltas.is_empty() {
                    let mut stmt = tx.prepare(&format!(
                        "UPDATE files_{label} SET
                            units_running=(SELECT count(*) FROM units_{label}
                                           WHERE status=1 AND file=files_{label}.id),
                            units_done=(SELECT count(*) FROM units_{label}
                                        WHERE status IN (2, 6, 7, 8) AND file=files_{label}.id),
                            events_read=events_read + ?1,
                            skipped=skipped + ?2
                         WHERE id=?3"
                    ))?;
                    for delta in deltas {
                        stmt.execute(params![delta.events_read, delta.skipped, delta.file])?;
                    }
                }
            }

            {
                let assignments = TaskUpdate::COLUMNS
                    .iter()
                    .map(|c| format!("{c}=?"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut stmt =
                    tx.prepare(&format!("UPDATE tasks SET {assignments} WHERE id=?"))?;
                for batch in batches {
                    for outcome in &batch.outcomes {
                        let values = outcome.task.sql_params();
                        stmt.execute(&values[..])?;
                    }
                }
            }

            let mut labels: Vec<&str> = batches.iter().map(|b| b.label.as_str()).collect();
            labels.sort_unstable();
            labels.dedup();
            for label in labels {
                self.refresh_stats(&tx, label)?;
            }

            tx.commit()?;
            Ok(())
        })
    }

    /// Recompute a workflow's derived counters and, when a target runtime
    /// is configured, re-evaluate its task size.
    pub fn update_workflow_stats(&self, label: &str) -> Result<()> {
        validate_label(label)?;
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        self.refresh_stats(&tx, label)?;
        tx.commit()?;
        Ok(())
    }

    /// Stats refresh inside the caller's transaction.
    pub(crate) fn refresh_stats(&self, conn: &Connection, label: &str) -> Result<()> {
        let row: Option<(i64, i64, Option<i64>)> = conn
            .query_row(
                "SELECT id, tasksize, taskruntime FROM workflows WHERE label=?1",
                params![label],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (id, tasksize, taskruntime) =
            row.ok_or_else(|| LumiflowError::UnknownWorkflow(label.to_string()))?;

        if let Some(target) = taskruntime {
            // Mean seconds per unit between stage-in end and epilogue end,
            // over this workflow's completed processing tasks.
            let (completed, unit_time): (i64, Option<f64>) = conn.query_row(
                "SELECT count(*),
                        avg((time_epilogue_end - time_stage_in_end) * 1.0 / units)
                 FROM tasks
                 WHERE status IN (2, 6, 7, 8) AND workflow=?1 AND type=0",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            if completed >= 10 {
                if let Some(better) =
                    unit_time.and_then(|t| sizer::better_task_size(target, t, tasksize))
                {
                    info!(label, from = tasksize, to = better, "adjusting task size");
                    conn.execute(
                        "UPDATE workflows SET tasksize=?1 WHERE id=?2",
                        params![better, id],
                    )?;
                }
            }
        }

        conn.execute(
            &format!(
                "UPDATE workflows SET
                    units_running=(SELECT count(*) FROM units_{label} WHERE status=1),
                    units_done=(SELECT count(*) FROM units_{label}
                                WHERE status IN (2, 6, 7, 8)),
                    units_paused=(SELECT count(*) FROM units_{label}
                                  WHERE (failed > ?1 OR file IN
                                         (SELECT id FROM files_{label} WHERE skipped >= ?2))
                                    AND status IN (0, 3, 4))
                 WHERE label=?3"
            ),
            params![self.failure_threshold, self.skipping_threshold, label],
        )?;

        conn.execute(
            "UPDATE workflows SET
                units_left = units - (units_running + units_done + units_paused)
             WHERE label=?1",
            params![label],
        )?;

        Ok(())
    }

    /// Crash recovery: abort every in-flight task and roll half-merged work
    /// back to SUCCESSFUL. Idempotent; returns the ids of the tasks that
    /// were running so the caller can clean up worker state.
    pub fn reset_units(&self) -> Result<Vec<i64>> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare("SELECT id FROM tasks WHERE status=1 ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        tx.execute("UPDATE workflows SET units_running=0, merged=0", [])?;
        tx.execute("UPDATE tasks SET status=4 WHERE status=1", [])?;
        tx.execute("UPDATE tasks SET status=2 WHERE status=7", [])?;

        let labels: Vec<String> = {
            let mut stmt = tx.prepare("SELECT label FROM workflows")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        for label in &labels {
            validate_label(label)?;
            tx.execute(&format!("UPDATE files_{label} SET units_running=0"), [])?;
            tx.execute(
                &format!("UPDATE units_{label} SET status=4 WHERE status=1"),
                [],
            )?;
            tx.execute(
                &format!("UPDATE units_{label} SET status=2 WHERE status=7"),
                [],
            )?;
            self.refresh_stats(&tx, label)?;
        }

        tx.commit()?;

        debug!(recovered = ids.len(), "reset running state");
        Ok(ids)
    }

    /// Record publication: flip the named processing tasks (and the
    /// constituents of the named merge tasks) to PUBLISHED, then cascade
    /// the status to their units.
    ///
    /// `blocks` entries are `(block_name, processing_task_id, merge_task_id)`.
    pub fn update_published(&self, blocks: &[(String, i64, i64)]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        for (name, task, merge_task) in blocks {
            tx.execute(
                "UPDATE tasks SET status=6, published_file_block=?1 WHERE id=?2",
                params![name, task],
            )?;
            tx.execute(
                "UPDATE tasks SET status=6, published_file_block=?1 WHERE task=?2",
                params![name, merge_task],
            )?;
        }

        for (_, task, _) in blocks {
            let label: Option<String> = tx
                .query_row(
                    "SELECT workflows.label FROM tasks, workflows
                     WHERE tasks.id=?1 AND tasks.workflow=workflows.id",
                    params![task],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(label) = label {
                validate_label(&label)?;
                tx.execute(
                    &format!("UPDATE units_{label} SET status=6 WHERE task=?1"),
                    params![task],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Mark tasks whose outputs went missing: their units and the tasks
    /// themselves become FAILED, and merge constituents referencing them
    /// through the `task` column revert to SUCCESSFUL.
    pub fn update_missing(&self, tasks: &[i64]) -> Result<()> {
        with_retry(|| {
            let mut conn = self.lock_conn()?;
            let tx = conn.transaction()?;

            for task in tasks {
                let label: Option<String> = tx
                    .query_row(
                        "SELECT workflows.label FROM tasks, workflows
                         WHERE tasks.id=?1 AND tasks.workflow=workflows.id",
                        params![task],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(label) = label {
                    validate_label(&label)?;
                    tx.execute(
                        &format!("UPDATE units_{label} SET status=3 WHERE task=?1"),
                        params![task],
                    )?;
                }
            }

            for task in tasks {
                tx.execute("UPDATE tasks SET status=3 WHERE id=?1", params![task])?;
                tx.execute("UPDATE tasks SET status=2 WHERE task=?1", params![task])?;
            }

            tx.commit()?;
            Ok(())
        })
    }

    /// Record the parameter-set hash computed for a workflow.
    pub fn update_pset_hash(&self, pset_hash: &str, label: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE workflows SET pset_hash=?1 WHERE label=?2",
            params![pset_hash, label],
        )?;
        Ok(())
    }

    fn workflow_id(&self, conn: &Connection, label: &str) -> Result<i64> {
        conn.query_row(
            "SELECT id FROM workflows WHERE label=?1",
            params![label],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| LumiflowError::UnknownWorkflow(label.to_string()))
    }

    fn tasks_with_status(&self, label: &str, clause: &str) -> Result<Vec<(i64, TaskType)>> {
        let conn = self.lock_conn()?;
        let id = self.workflow_id(&conn, label)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, type FROM tasks WHERE {clause} AND workflow=?1"
        ))?;
        let rows = stmt.query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<_, _>>()
            .map_err(Into::into)
    }

    /// SUCCESSFUL tasks of a workflow, as (id, type).
    pub fn successful_tasks(&self, label: &str) -> Result<Vec<(i64, TaskType)>> {
        self.tasks_with_status(label, "status=2")
    }

    /// MERGED tasks of a workflow, as (id, type).
    pub fn merged_tasks(&self, label: &str) -> Result<Vec<(i64, TaskType)>> {
        self.tasks_with_status(label, "status=8")
    }

    /// FAILED and ABORTED tasks of a workflow, as (id, type).
    pub fn failed_tasks(&self, label: &str) -> Result<Vec<(i64, TaskType)>> {
        self.tasks_with_status(label, "status IN (3, 4)")
    }

    /// Task ids holding units that failed past the pause threshold.
    pub fn failed_units(&self, label: &str) -> Result<Vec<i64>> {
        validate_label(label)?;
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT task FROM units_{label} WHERE failed > ?1"
        ))?;
        let rows = stmt.query_map(params![self.failure_threshold], |row| {
            row.get::<_, Option<i64>>(0)
        })?;
        let tasks: Vec<Option<i64>> = rows.collect::<std::result::Result<_, _>>()?;
        Ok(tasks.into_iter().flatten().collect())
    }

    /// Filenames skipped often enough to be excluded from packing.
    pub fn skipped_files(&self, label: &str) -> Result<Vec<String>> {
        validate_label(label)?;
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT filename FROM files_{label} WHERE skipped > ?1"
        ))?;
        let rows = stmt.query_map(params![self.skipping_threshold], |row| row.get(0))?;
        rows.collect::<std::result::Result<_, _>>()
            .map_err(Into::into)
    }

    /// Ids of all currently ASSIGNED tasks.
    pub fn running_tasks(&self) -> Result<Vec<i64>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT id FROM tasks WHERE status=1")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<_, _>>()
            .map_err(Into::into)
    }

    /// Units not yet done or paused, across all workflows.
    pub fn unfinished_units(&self) -> Result<i64> {
        let conn = self.lock_conn()?;
        let sum: Option<i64> = conn.query_row(
            "SELECT sum(units - units_done - units_paused) FROM workflows",
            [],
            |row| row.get(0),
        )?;
        Ok(sum.unwrap_or(0))
    }

    /// Currently running units, across all workflows.
    pub fn running_units(&self) -> Result<i64> {
        let conn = self.lock_conn()?;
        let sum: Option<i64> = conn.query_row(
            "SELECT sum(units_running) FROM workflows",
            [],
            |row| row.get(0),
        )?;
        Ok(sum.unwrap_or(0))
    }

    /// Configuration snapshot of a workflow, if registered.
    pub fn workflow_info(&self, label: &str) -> Result<Option<WorkflowInfo>> {
        let conn = self.lock_conn()?;
        let info = conn
            .query_row(
                "SELECT dataset, path, release, global_tag, publish_label, cfg,
                        pset_hash, id, uuid
                 FROM workflows WHERE label=?1",
                params![label],
                |row| {
                    Ok(WorkflowInfo {
                        dataset: row.get(0)?,
                        path: row.get(1)?,
                        release: row.get(2)?,
                        global_tag: row.get(3)?,
                        publish_label: row.get(4)?,
                        cfg: row.get(5)?,
                        pset_hash: row.get(6)?,
                        id: row.get(7)?,
                        uuid: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    /// Per-workflow progress rows for a status display.
    pub fn workflow_status(&self) -> Result<Vec<WorkflowProgress>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT
                label,
                events,
                ifnull((SELECT sum(events_read) FROM tasks
                        WHERE status IN (2, 6, 8) AND type=0 AND workflow=workflows.id), 0),
                ifnull((SELECT sum(events_written) FROM tasks
                        WHERE status IN (2, 6, 8) AND type=0 AND workflow=workflows.id), 0),
                units + masked_lumis,
                units,
                units_done,
                units_paused
             FROM workflows",
        )?;
        let rows = stmt.query_map([], |row| {
            let units: i64 = row.get(5)?;
            let units_done: i64 = row.get(6)?;
            Ok(WorkflowProgress {
                label: row.get(0)?,
                events: row.get(1)?,
                events_read: row.get(2)?,
                events_written: row.get(3)?,
                total_units: row.get(4)?,
                units,
                units_done,
                units_paused: row.get(7)?,
                percent: if units > 0 {
                    (units_done as f64 * 1000.0 / units as f64).round() / 10.0
                } else {
                    0.0
                },
            })
        })?;
        rows.collect::<std::result::Result<_, _>>()
            .map_err(Into::into)
    }

    /// True iff every workflow has been fully merged.
    pub fn merged(&self) -> Result<bool> {
        let conn = self.lock_conn()?;
        let unmerged: i64 = conn.query_row(
            "SELECT count(*) FROM workflows WHERE merged <> 1",
            [],
            |row| row.get(0),
        )?;
        Ok(unmerged == 0)
    }

    /// How many processing tasks the remaining units amount to.
    pub fn estimate_tasks_left(&self) -> Result<i64> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT units_left, tasksize FROM workflows WHERE units_left > 0",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut total = 0;
        for row in rows {
            let (left, size) = row?;
            total += (left as f64 / size as f64).ceil() as i64;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatasetFile, DatasetInfo, FileDelta, TaskOutcome, UnitStatusUpdate};

    fn dataset(files: Vec<DatasetFile>, tasksize: i64) -> DatasetInfo {
        let total_lumis = files.iter().map(|f| f.lumis.len() as i64).sum();
        let total_events = files.iter().map(|f| f.events).sum();
        DatasetInfo {
            path: "/store/data/Run2012A".to_string(),
            files,
            total_lumis,
            masked_lumis: 0,
            total_events,
            tasksize,
            file_based: false,
            empty_source: false,
        }
    }

    fn file(name: &str, lumis: &[(i64, i64)]) -> DatasetFile {
        DatasetFile {
            filename: name.to_string(),
            lumis: lumis.to_vec(),
            events: 100 * lumis.len() as i64,
            bytes: 1 << 20,
        }
    }

    fn counters(store: &UnitStore, label: &str) -> (i64, i64, i64, i64, i64) {
        let conn = store.lock_conn().unwrap();
        conn.query_row(
            "SELECT units, units_done, units_left, units_paused, units_running
             FROM workflows WHERE label=?1",
            params![label],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .unwrap()
    }

    /// Bind units to a fresh ASSIGNED task, bypassing the scheduler.
    fn assign(store: &UnitStore, label: &str, units: &[i64]) -> i64 {
        let task = {
            let conn = store.lock_conn().unwrap();
            conn.execute(
                "INSERT INTO tasks (workflow, status, type, units)
                 VALUES ((SELECT id FROM workflows WHERE label=?1), 1, 0, ?2)",
                params![label, units.len() as i64],
            )
            .unwrap();
            let task = conn.last_insert_rowid();
            for unit in units {
                conn.execute(
                    &format!("UPDATE units_{label} SET status=1, task=?1 WHERE id=?2"),
                    params![task, unit],
                )
                .unwrap();
            }
            task
        };
        store.update_workflow_stats(label).unwrap();
        task
    }

    fn outcome(task: i64, status: Status) -> TaskOutcome {
        TaskOutcome {
            task: TaskUpdate {
                id: task,
                status,
                ..Default::default()
            },
            files: Vec::new(),
            units: Vec::new(),
        }
    }

    fn batch(label: &str, source: UnitSource, outcomes: Vec<TaskOutcome>) -> UpdateBatch {
        UpdateBatch {
            label: label.to_string(),
            source,
            outcomes,
        }
    }

    #[test]
    fn test_register_counters() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(
            vec![
                file("a.root", &[(1, 1), (1, 2)]),
                file("b.root", &[(1, 3), (1, 4)]),
            ],
            2,
        );
        store
            .register(&WorkflowConfig::new("trial"), &ds, None)
            .unwrap();

        let (units, done, left, paused, running) = counters(&store, "trial");
        assert_eq!(units, 4);
        assert_eq!(left, 4);
        assert_eq!(done + paused + running, 0);

        let conn = store.lock_conn().unwrap();
        let files: i64 = conn
            .query_row("SELECT count(*) FROM files_trial", [], |r| r.get(0))
            .unwrap();
        let unit_rows: i64 = conn
            .query_row("SELECT count(*) FROM units_trial", [], |r| r.get(0))
            .unwrap();
        assert_eq!(files, 2);
        assert_eq!(unit_rows, 4);

        let uuid: String = conn
            .query_row("SELECT uuid FROM workflows WHERE label='trial'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(uuid, store.run_uuid());
    }

    #[test]
    fn test_register_argument_fanout() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1), (1, 2)])], 2);
        let mut workflow = WorkflowConfig::new("fanout");
        workflow.unique_parameters = vec!["seed=1".to_string(), "seed=2".to_string()];
        store.register(&workflow, &ds, None).unwrap();

        let (units, _, left, _, _) = counters(&store, "fanout");
        assert_eq!(units, 4);
        assert_eq!(left, 4);

        let conn = store.lock_conn().unwrap();
        let unit_rows: i64 = conn
            .query_row("SELECT count(*) FROM units_fanout", [], |r| r.get(0))
            .unwrap();
        let file_units: i64 = conn
            .query_row("SELECT units FROM files_fanout", [], |r| r.get(0))
            .unwrap();
        let with_arg: i64 = conn
            .query_row(
                "SELECT count(*) FROM units_fanout WHERE arg='seed=2'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(unit_rows, 4);
        assert_eq!(file_units, 4);
        assert_eq!(with_arg, 2);
    }

    #[test]
    fn test_register_rejects_bad_label() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1)])], 1);
        let workflow = WorkflowConfig::new("bad-label");
        assert!(store.register(&workflow, &ds, None).is_err());
    }

    #[test]
    fn test_update_units_success() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1), (1, 2)])], 2);
        store
            .register(&WorkflowConfig::new("wf"), &ds, None)
            .unwrap();
        let task = assign(&store, "wf", &[1, 2]);

        let mut done = outcome(task, Status::Successful);
        done.task.events_read = 200;
        done.task.events_written = 180;
        done.task.host = "worker-17".to_string();
        done.files.push(FileDelta {
            events_read: 200,
            skipped: 0,
            file: 1,
        });
        store
            .update_units(&[batch("wf", UnitSource::Units, vec![done])])
            .unwrap();

        let (units, done, left, paused, running) = counters(&store, "wf");
        assert_eq!((units, done, left, paused, running), (2, 2, 0, 0, 0));

        let conn = store.lock_conn().unwrap();
        let (f_done, f_running, f_read): (i64, i64, i64) = conn
            .query_row(
                "SELECT units_done, units_running, events_read FROM files_wf WHERE id=1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!((f_done, f_running, f_read), (2, 0, 200));

        let (status, read, host): (Status, i64, String) = conn
            .query_row(
                "SELECT status, events_read, host FROM tasks WHERE id=?1",
                params![task],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(status, Status::Successful);
        assert_eq!(read, 200);
        assert_eq!(host, "worker-17");
    }

    #[test]
    fn test_update_units_selective_overlay() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1), (1, 2)])], 2);
        store
            .register(&WorkflowConfig::new("wf"), &ds, None)
            .unwrap();
        let task = assign(&store, "wf", &[1, 2]);

        // task succeeded but the report missed lumi (1, 2)
        let mut done = outcome(task, Status::Successful);
        done.units.push(UnitStatusUpdate {
            status: Status::Failed,
            unit: 2,
        });
        done.files.push(FileDelta {
            events_read: 100,
            skipped: 0,
            file: 1,
        });
        store
            .update_units(&[batch("wf", UnitSource::Units, vec![done])])
            .unwrap();

        let conn = store.lock_conn().unwrap();
        let s1: Status = conn
            .query_row("SELECT status FROM units_wf WHERE id=1", [], |r| r.get(0))
            .unwrap();
        let s2: Status = conn
            .query_row("SELECT status FROM units_wf WHERE id=2", [], |r| r.get(0))
            .unwrap();
        assert_eq!(s1, Status::Successful);
        assert_eq!(s2, Status::Failed);

        let f_done: i64 = conn
            .query_row("SELECT units_done FROM files_wf WHERE id=1", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(f_done, 1);
    }

    #[test]
    fn test_repeated_failures_pause_units() {
        let store = UnitStore::in_memory(2, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1), (1, 2)])], 2);
        store
            .register(&WorkflowConfig::new("wf"), &ds, None)
            .unwrap();

        for round in 1..=3i64 {
            let task = assign(&store, "wf", &[1, 2]);
            let mut failed = outcome(task, Status::Failed);
            failed.files.push(FileDelta {
                events_read: 0,
                skipped: 0,
                file: 1,
            });
            store
                .update_units(&[batch("wf", UnitSource::Units, vec![failed])])
                .unwrap();

            let conn = store.lock_conn().unwrap();
            let fail_count: i64 = conn
                .query_row("SELECT failed FROM units_wf WHERE id=1", [], |r| r.get(0))
                .unwrap();
            assert_eq!(fail_count, round);
        }

        // three failures against a threshold of two pauses both units
        let (units, done, left, paused, running) = counters(&store, "wf");
        assert_eq!((units, done, left, paused, running), (2, 0, 0, 2, 0));
    }

    #[test]
    fn test_two_failures_not_yet_paused() {
        let store = UnitStore::in_memory(2, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1)])], 1);
        store
            .register(&WorkflowConfig::new("wf"), &ds, None)
            .unwrap();

        for _ in 0..2 {
            let task = assign(&store, "wf", &[1]);
            store
                .update_units(&[batch("wf", UnitSource::Units, vec![outcome(task, Status::Failed)])])
                .unwrap();
        }

        let (_, _, left, paused, _) = counters(&store, "wf");
        assert_eq!(paused, 0);
        assert_eq!(left, 1);
    }

    #[test]
    fn test_skipped_file_pauses_units() {
        let store = UnitStore::in_memory(10, 3).unwrap();
        let ds = dataset(
            vec![
                file("good.root", &[(1, 1)]),
                file("bad.root", &[(1, 2), (1, 3)]),
            ],
            3,
        );
        store
            .register(&WorkflowConfig::new("wf"), &ds, None)
            .unwrap();

        {
            let conn = store.lock_conn().unwrap();
            conn.execute("UPDATE files_wf SET skipped=3 WHERE id=2", [])
                .unwrap();
        }
        store.update_workflow_stats("wf").unwrap();

        let (units, _, left, paused, _) = counters(&store, "wf");
        assert_eq!(units, 3);
        assert_eq!(paused, 2);
        assert_eq!(left, 1);
    }

    #[test]
    fn test_update_units_merge_source() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1), (1, 2)])], 2);
        store
            .register(&WorkflowConfig::new("wf"), &ds, None)
            .unwrap();

        let (merge, first, second) = {
            let conn = store.lock_conn().unwrap();
            let wf: i64 = conn
                .query_row("SELECT id FROM workflows WHERE label='wf'", [], |r| {
                    r.get(0)
                })
                .unwrap();
            conn.execute(
                "INSERT INTO tasks (workflow, units, status, type) VALUES (?1, 4, 1, 1)",
                params![wf],
            )
            .unwrap();
            let merge = conn.last_insert_rowid();
            let mut constituents = Vec::new();
            for _ in 0..2 {
                conn.execute(
                    "INSERT INTO tasks (workflow, units, status, type, task)
                     VALUES (?1, 2, 7, 0, ?2)",
                    params![wf, merge],
                )
                .unwrap();
                constituents.push(conn.last_insert_rowid());
            }
            (merge, constituents[0], constituents[1])
        };

        let mut merged = outcome(merge, Status::Successful);
        merged.task.bytes_bare_output = 900;
        store
            .update_units(&[batch("wf", UnitSource::Tasks, vec![merged])])
            .unwrap();

        let conn = store.lock_conn().unwrap();
        for task in [first, second] {
            let status: Status = conn
                .query_row("SELECT status FROM tasks WHERE id=?1", params![task], |r| {
                    r.get(0)
                })
                .unwrap();
            assert_eq!(status, Status::Merged);
        }
        let status: Status = conn
            .query_row("SELECT status FROM tasks WHERE id=?1", params![merge], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(status, Status::Successful);
    }

    #[test]
    fn test_failed_merge_releases_constituents() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1)])], 1);
        store
            .register(&WorkflowConfig::new("wf"), &ds, None)
            .unwrap();

        let (merge, constituent) = {
            let conn = store.lock_conn().unwrap();
            let wf: i64 = conn
                .query_row("SELECT id FROM workflows WHERE label='wf'", [], |r| {
                    r.get(0)
                })
                .unwrap();
            conn.execute(
                "INSERT INTO tasks (workflow, units, status, type) VALUES (?1, 2, 1, 1)",
                params![wf],
            )
            .unwrap();
            let merge = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO tasks (workflow, units, status, type, task)
                 VALUES (?1, 2, 7, 0, ?2)",
                params![wf, merge],
            )
            .unwrap();
            (merge, conn.last_insert_rowid())
        };

        store
            .update_units(&[batch(
                "wf",
                UnitSource::Tasks,
                vec![outcome(merge, Status::Failed)],
            )])
            .unwrap();

        let conn = store.lock_conn().unwrap();
        let status: Status = conn
            .query_row(
                "SELECT status FROM tasks WHERE id=?1",
                params![constituent],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(status, Status::Successful);
        let failed: i64 = conn
            .query_row(
                "SELECT failed FROM tasks WHERE id=?1",
                params![constituent],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(failed, 1);
    }

    fn state_snapshot(store: &UnitStore) -> Vec<(i64, i64, Option<i64>)> {
        let conn = store.lock_conn().unwrap();
        let mut rows = Vec::new();
        let mut stmt = conn
            .prepare("SELECT id, status, task FROM tasks ORDER BY id")
            .unwrap();
        let tasks = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap();
        for row in tasks {
            rows.push(row.unwrap());
        }
        let mut stmt = conn
            .prepare("SELECT id, status, task FROM units_wf ORDER BY id")
            .unwrap();
        let units = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap();
        for row in units {
            rows.push(row.unwrap());
        }
        rows
    }

    #[test]
    fn test_reset_aborts_running_and_reverts_merging() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let lumis: Vec<(i64, i64)> = (1..=7).map(|l| (1, l)).collect();
        let ds = dataset(vec![file("a.root", &lumis)], 1);
        store
            .register(&WorkflowConfig::new("wf"), &ds, None)
            .unwrap();

        // five in-flight tasks (the fifth is a merge parent) and two
        // half-merged constituents
        let mut assigned = Vec::new();
        for unit in 1..=4i64 {
            assigned.push(assign(&store, "wf", &[unit]));
        }
        let (merge, constituents) = {
            let conn = store.lock_conn().unwrap();
            let wf: i64 = conn
                .query_row("SELECT id FROM workflows WHERE label='wf'", [], |r| {
                    r.get(0)
                })
                .unwrap();
            conn.execute(
                "INSERT INTO tasks (workflow, units, status, type) VALUES (?1, 2, 1, 1)",
                params![wf],
            )
            .unwrap();
            let merge = conn.last_insert_rowid();
            let mut constituents = Vec::new();
            for unit in 5..=6i64 {
                conn.execute(
                    "INSERT INTO tasks (workflow, units, status, type, task)
                     VALUES (?1, 1, 7, 0, ?2)",
                    params![wf, merge],
                )
                .unwrap();
                let task = conn.last_insert_rowid();
                conn.execute(
                    "UPDATE units_wf SET status=2, task=?1 WHERE id=?2",
                    params![task, unit],
                )
                .unwrap();
                constituents.push(task);
            }
            (merge, constituents)
        };
        assigned.push(merge);

        let recovered = store.reset_units().unwrap();
        assert_eq!(recovered, assigned);

        let conn = store.lock_conn().unwrap();
        for task in &recovered {
            let status: Status = conn
                .query_row("SELECT status FROM tasks WHERE id=?1", params![task], |r| {
                    r.get(0)
                })
                .unwrap();
            assert_eq!(status, Status::Aborted);
        }
        for task in &constituents {
            let status: Status = conn
                .query_row("SELECT status FROM tasks WHERE id=?1", params![task], |r| {
                    r.get(0)
                })
                .unwrap();
            assert_eq!(status, Status::Successful);
        }
        let running: i64 = conn
            .query_row("SELECT count(*) FROM units_wf WHERE status=1", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(running, 0);
    }

    #[test]
    fn test_reset_idempotent() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1), (1, 2)])], 1);
        store
            .register(&WorkflowConfig::new("wf"), &ds, None)
            .unwrap();
        assign(&store, "wf", &[1]);

        let first = store.reset_units().unwrap();
        assert_eq!(first.len(), 1);
        let after_first = state_snapshot(&store);

        let second = store.reset_units().unwrap();
        assert!(second.is_empty());
        assert_eq!(state_snapshot(&store), after_first);
    }

    #[test]
    fn test_update_published_cascades() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1), (1, 2)])], 2);
        store
            .register(&WorkflowConfig::new("wf"), &ds, None)
            .unwrap();

        let (proc, merge) = {
            let conn = store.lock_conn().unwrap();
            let wf: i64 = conn
                .query_row("SELECT id FROM workflows WHERE label='wf'", [], |r| {
                    r.get(0)
                })
                .unwrap();
            conn.execute(
                "INSERT INTO tasks (workflow, units, status, type) VALUES (?1, 2, 2, 1)",
                params![wf],
            )
            .unwrap();
            let merge = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO tasks (workflow, units, status, type, task)
                 VALUES (?1, 2, 8, 0, ?2)",
                params![wf, merge],
            )
            .unwrap();
            let proc = conn.last_insert_rowid();
            conn.execute(
                "UPDATE units_wf SET status=8, task=?1",
                params![proc],
            )
            .unwrap();
            (proc, merge)
        };

        store
            .update_published(&[("block_001".to_string(), proc, merge)])
            .unwrap();

        let conn = store.lock_conn().unwrap();
        let (status, block): (Status, String) = conn
            .query_row(
                "SELECT status, published_file_block FROM tasks WHERE id=?1",
                params![proc],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, Status::Published);
        assert_eq!(block, "block_001");

        let published_units: i64 = conn
            .query_row("SELECT count(*) FROM units_wf WHERE status=6", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(published_units, 2);
    }

    #[test]
    fn test_update_missing_fails_tasks_and_frees_merges() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1), (1, 2)])], 2);
        store
            .register(&WorkflowConfig::new("wf"), &ds, None)
            .unwrap();
        let task = assign(&store, "wf", &[1, 2]);

        let (merge, constituent) = {
            let conn = store.lock_conn().unwrap();
            let wf: i64 = conn
                .query_row("SELECT id FROM workflows WHERE label='wf'", [], |r| {
                    r.get(0)
                })
                .unwrap();
            conn.execute(
                "INSERT INTO tasks (workflow, units, status, type) VALUES (?1, 2, 1, 1)",
                params![wf],
            )
            .unwrap();
            let merge = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO tasks (workflow, units, status, type, task)
                 VALUES (?1, 2, 7, 0, ?2)",
                params![wf, merge],
            )
            .unwrap();
            (merge, conn.last_insert_rowid())
        };

        store.update_missing(&[task, merge]).unwrap();

        let conn = store.lock_conn().unwrap();
        for id in [task, merge] {
            let status: Status = conn
                .query_row("SELECT status FROM tasks WHERE id=?1", params![id], |r| {
                    r.get(0)
                })
                .unwrap();
            assert_eq!(status, Status::Failed);
        }
        let status: Status = conn
            .query_row(
                "SELECT status FROM tasks WHERE id=?1",
                params![constituent],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(status, Status::Successful);

        let failed_units: i64 = conn
            .query_row("SELECT count(*) FROM units_wf WHERE status=3", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(failed_units, 2);
    }

    #[test]
    fn test_adaptive_sizing_applied() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1), (1, 2)])], 10);
        store
            .register(&WorkflowConfig::new("wf"), &ds, Some(600))
            .unwrap();

        {
            let conn = store.lock_conn().unwrap();
            let wf: i64 = conn
                .query_row("SELECT id FROM workflows WHERE label='wf'", [], |r| {
                    r.get(0)
                })
                .unwrap();
            // twelve completed tasks at 50 seconds per unit
            for _ in 0..12 {
                conn.execute(
                    "INSERT INTO tasks (workflow, units, status, type,
                                        time_stage_in_end, time_epilogue_end)
                     VALUES (?1, 4, 2, 0, 1000, 1200)",
                    params![wf],
                )
                .unwrap();
            }
        }

        store.update_workflow_stats("wf").unwrap();

        let conn = store.lock_conn().unwrap();
        let tasksize: i64 = conn
            .query_row("SELECT tasksize FROM workflows WHERE label='wf'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(tasksize, 12);
    }

    #[test]
    fn test_adaptive_sizing_needs_completed_tasks() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1)])], 10);
        store
            .register(&WorkflowConfig::new("wf"), &ds, Some(600))
            .unwrap();

        {
            let conn = store.lock_conn().unwrap();
            let wf: i64 = conn
                .query_row("SELECT id FROM workflows WHERE label='wf'", [], |r| {
                    r.get(0)
                })
                .unwrap();
            for _ in 0..5 {
                conn.execute(
                    "INSERT INTO tasks (workflow, units, status, type,
                                        time_stage_in_end, time_epilogue_end)
                     VALUES (?1, 4, 2, 0, 1000, 1200)",
                    params![wf],
                )
                .unwrap();
            }
        }

        store.update_workflow_stats("wf").unwrap();

        let conn = store.lock_conn().unwrap();
        let tasksize: i64 = conn
            .query_row("SELECT tasksize FROM workflows WHERE label='wf'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(tasksize, 10);
    }

    #[test]
    fn test_accessors() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1), (1, 2)])], 2);
        store
            .register(&WorkflowConfig::new("wf"), &ds, None)
            .unwrap();
        let task = assign(&store, "wf", &[1, 2]);

        assert_eq!(store.running_tasks().unwrap(), vec![task]);
        assert_eq!(store.running_units().unwrap(), 2);
        assert_eq!(store.unfinished_units().unwrap(), 2);
        assert!(store.successful_tasks("wf").unwrap().is_empty());
        assert!(!store.merged().unwrap());

        let mut done = outcome(task, Status::Successful);
        done.files.push(FileDelta {
            events_read: 150,
            skipped: 0,
            file: 1,
        });
        done.task.events_read = 150;
        done.task.events_written = 140;
        store
            .update_units(&[batch("wf", UnitSource::Units, vec![done])])
            .unwrap();

        let successful = store.successful_tasks("wf").unwrap();
        assert_eq!(successful, vec![(task, TaskType::Process)]);
        assert!(store.failed_tasks("wf").unwrap().is_empty());
        assert_eq!(store.running_units().unwrap(), 0);

        let progress = store.workflow_status().unwrap();
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].label, "wf");
        assert_eq!(progress[0].events_read, 150);
        assert_eq!(progress[0].events_written, 140);
        assert_eq!(progress[0].units_done, 2);
        assert_eq!(progress[0].percent, 100.0);

        let info = store.workflow_info("wf").unwrap().unwrap();
        assert_eq!(info.dataset, "wf");
        assert_eq!(info.publish_label, "wf");
        assert!(store.workflow_info("nope").unwrap().is_none());
    }

    #[test]
    fn test_estimate_tasks_left() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1), (1, 2), (1, 3)])], 2);
        store
            .register(&WorkflowConfig::new("wf"), &ds, None)
            .unwrap();
        assert_eq!(store.estimate_tasks_left().unwrap(), 2);
    }

    #[test]
    fn test_update_pset_hash() {
        let store = UnitStore::in_memory(10, 10).unwrap();
        let ds = dataset(vec![file("a.root", &[(1, 1)])], 1);
        store
            .register(&WorkflowConfig::new("wf"), &ds, None)
            .unwrap();
        store.update_pset_hash("abcdef0123", "wf").unwrap();
        let info = store.workflow_info("wf").unwrap().unwrap();
        assert_eq!(info.pset_hash.as_deref(), Some("abcdef0123"));
    }
}
