//! Task packing: turning store state into ready-to-dispatch descriptors
//!
//! Two algorithms live here. `pop_units` drains unfinished units into
//! processing tasks, tapering the task size when less work remains than
//! workers demand. `pop_merge` bin-packs successful processing tasks into
//! merge tasks bounded by an output byte budget. Workflows are visited in
//! random order both times; the randomization is a fairness feature, so the
//! RNG is owned here and seedable for reproducible tests.

use crate::error::Result;
use crate::models::{TaskDescriptor, UnitSpec};
use crate::retry::with_retry;
use crate::store::UnitStore;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rusqlite::{params, Connection};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tracing::debug;

/// Candidate units are fetched with their file ids spliced into an IN
/// clause, this many files at a time.
const FILE_CHUNK: usize = 40;

/// Fraction of the byte budget a merge bin must reach to be emitted while
/// its workflow still produces output.
const MERGE_FILL_GATE: f64 = 0.9;

struct WorkflowSlot {
    label: String,
    id: i64,
    units_left: i64,
    tasksize: i64,
    empty_source: bool,
}

impl WorkflowSlot {
    fn estimated_tasks(&self) -> f64 {
        self.units_left as f64 / self.tasksize as f64
    }
}

/// A merge bin under construction: constituent task ids, their summed unit
/// count, and the accumulated bare output bytes.
struct MergeBin {
    tasks: Vec<i64>,
    units: i64,
    size: i64,
}

impl MergeBin {
    fn new(task: i64, units: i64, size: i64) -> Self {
        Self {
            tasks: vec![task],
            units,
            size,
        }
    }

    fn add(&mut self, task: i64, units: i64, size: i64, maxsize: i64) -> bool {
        if self.size + size > maxsize {
            return false;
        }
        self.size += size;
        self.units += units;
        self.tasks.push(task);
        true
    }
}

/// Converts store state into task descriptors.
pub struct Scheduler {
    store: UnitStore,
    rng: Mutex<StdRng>,
}

impl Scheduler {
    pub fn new(store: UnitStore) -> Self {
        Self {
            store,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// A scheduler with a fixed workflow-shuffle seed, for reproducible
    /// tests.
    pub fn with_seed(store: UnitStore, seed: u64) -> Self {
        Self {
            store,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn store(&self) -> &UnitStore {
        &self.store
    }

    fn shuffle<T>(&self, rows: &mut [T]) {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        rows.shuffle(&mut *rng);
    }

    /// Create up to `num` processing tasks, drawn from all workflows with
    /// unfinished units.
    ///
    /// When fewer tasks remain than requested, the per-workflow task size
    /// is tapered down so every worker still receives work. Units are
    /// marked ASSIGNED and bound to their task before the descriptors are
    /// returned.
    pub fn pop_units(&self, num: usize) -> Result<Vec<TaskDescriptor>> {
        let mut rows = self.workflows_with_work()?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let tasks_left: i64 = rows
            .iter()
            .map(|slot| slot.estimated_tasks().ceil() as i64)
            .sum();

        self.shuffle(&mut rows);

        let mut tasks = Vec::new();
        if tasks_left < num as i64 {
            // less work than demand: shrink tasks to occupy all workers
            let taper = tasks_left as f64 / num as f64;
            for slot in &rows {
                let tasksize = ((taper * slot.tasksize as f64).ceil() as i64).max(1);
                let count = ((slot.estimated_tasks() / taper).ceil() as i64).max(1);
                let sizes = vec![tasksize; count as usize];
                tasks.extend(self.pop_workflow_units(&sizes, slot)?);
            }
        } else {
            for slot in &rows {
                let count = ((slot.estimated_tasks() * num as f64 / tasks_left as f64).ceil()
                    as i64)
                    .max(1);
                let sizes = vec![slot.tasksize; count as usize];
                tasks.extend(self.pop_workflow_units(&sizes, slot)?);
            }
        }
        Ok(tasks)
    }

    fn workflows_with_work(&self) -> Result<Vec<WorkflowSlot>> {
        let conn = self.store.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT label, id, units_left, tasksize, empty_source
             FROM workflows WHERE units_left > 0",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(WorkflowSlot {
                label: row.get(0)?,
                id: row.get(1)?,
                units_left: row.get(2)?,
                tasksize: row.get(3)?,
                empty_source: row.get(4)?,
            })
        })?;
        rows.collect::<std::result::Result<_, _>>()
            .map_err(Into::into)
    }

    /// Pack one workflow's candidate units into tasks of the given sizes,
    /// in a single transaction. Rolls back (discarding the inserted task
    /// rows) when no unit could be bound.
    fn pop_workflow_units(
        &self,
        sizes: &[i64],
        slot: &WorkflowSlot,
    ) -> Result<Vec<TaskDescriptor>> {
        debug!(
            tasks = sizes.len(),
            workflow = %slot.label,
            "creating processing task(s)"
        );

        with_retry(|| {
            let mut conn = self.store.lock_conn()?;
            let tx = conn.transaction()?;
            let descriptors = self.pack_units(&tx, sizes, slot)?;
            if descriptors.is_empty() {
                tx.rollback()?;
                Ok(Vec::new())
            } else {
                tx.commit()?;
                Ok(descriptors)
            }
        })
    }

    fn pack_units(
        &self,
        tx: &Connection,
        sizes: &[i64],
        slot: &WorkflowSlot,
    ) -> Result<Vec<TaskDescriptor>> {
        let label = slot.label.as_str();
        let failure_threshold = self.store.failure_threshold();

        // Files with units to give, least-skipped first.
        let mut filenames: HashMap<i64, String> = HashMap::new();
        let mut file_ids: Vec<i64> = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT id, filename FROM files_{label}
                 WHERE (units_done + units_running < units) AND (skipped < ?1)
                 ORDER BY skipped ASC"
            ))?;
            let rows = stmt.query_map(params![self.store.skipping_threshold()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (id, filename) = row?;
                file_ids.push(id);
                filenames.insert(id, filename);
            }
        }

        // Candidate units, fetched in file chunks.
        let mut candidates: Vec<(i64, i64, i64, i64, Option<String>, i64)> = Vec::new();
        for chunk in file_ids.chunks(FILE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut stmt = tx.prepare(&format!(
                "SELECT id, file, run, lumi, arg, failed FROM units_{label}
                 WHERE file IN ({placeholders}) AND status NOT IN (1, 2, 6, 7, 8)"
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?;
            for row in rows {
                candidates.push(row?);
            }
        }

        let mut descriptors: Vec<TaskDescriptor> = Vec::new();

        // lumi veto to avoid duplicated processing
        let mut all_lumis: BTreeSet<(i64, i64)> = BTreeSet::new();

        let mut task_files: BTreeSet<i64> = BTreeSet::new();
        let mut task_units: Vec<UnitSpec> = Vec::new();
        let mut current_arg: Option<String> = None;
        let mut current_size: i64 = 0;
        let mut next_slot = 0usize;

        let mut gather = tx.prepare(&format!(
            "SELECT id, file, run, lumi FROM units_{label}
             WHERE run=?1 AND lumi=?2 AND status NOT IN (1, 2, 6, 7, 8) AND failed < ?3"
        ))?;

        for (id, file, run, lumi, arg, failed) in candidates {
            if all_lumis.contains(&(run, lumi)) || failed > failure_threshold {
                continue;
            }

            if current_size == 0 && next_slot >= sizes.len() {
                break;
            }

            if failed == failure_threshold {
                // Last chance: isolate the unit so the poison one is
                // pinpointed by its own task.
                let files = vec![(file, self.filename(tx, label, &mut filenames, file)?)];
                let units = vec![UnitSpec {
                    id,
                    file: Some(file),
                    run,
                    lumi,
                }];
                descriptors.push(self.insert_task(tx, slot, files, units, arg.clone())?);
                continue;
            }

            if lumi > 0 {
                all_lumis.insert((run, lumi));
                // Pull in every unprocessed unit of this lumi, across files.
                let rows = gather.query_map(params![run, lumi, failure_threshold], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
                for row in rows {
                    let (ls_id, ls_file, ls_run, ls_lumi): (i64, i64, i64, i64) = row?;
                    task_units.push(UnitSpec {
                        id: ls_id,
                        file: Some(ls_file),
                        run: ls_run,
                        lumi: ls_lumi,
                    });
                    task_files.insert(ls_file);
                }
            } else {
                task_units.push(UnitSpec {
                    id,
                    file: Some(file),
                    run,
                    lumi,
                });
                task_files.insert(file);
            }

            current_arg = arg;
            current_size += 1;

            if current_size == sizes[next_slot] {
                let files = self.filenames_for(tx, label, &mut filenames, &task_files)?;
                descriptors.push(self.insert_task(
                    tx,
                    slot,
                    files,
                    std::mem::take(&mut task_units),
                    current_arg.clone(),
                )?);
                task_files.clear();
                current_size = 0;
                next_slot += 1;
            }
        }

        if current_size > 0 {
            let files = self.filenames_for(tx, label, &mut filenames, &task_files)?;
            descriptors.push(self.insert_task(
                tx,
                slot,
                files,
                std::mem::take(&mut task_units),
                current_arg,
            )?);
        }

        drop(gather);

        // Bind units to their tasks and bump the running counters. The
        // workflow counters are recomputed at the end so units_left is
        // consistent the moment the transaction lands.
        let mut bound = 0i64;
        let mut per_file: HashMap<i64, i64> = HashMap::new();
        {
            let mut set_units = tx.prepare("UPDATE tasks SET units=?1 WHERE id=?2")?;
            let mut bind = tx.prepare(&format!(
                "UPDATE units_{label} SET status=1, task=?1 WHERE id=?2"
            ))?;
            for descriptor in &descriptors {
                set_units.execute(params![descriptor.units.len() as i64, descriptor.id])?;
                for unit in &descriptor.units {
                    bind.execute(params![descriptor.id, unit.id])?;
                    bound += 1;
                    if let Some(file) = unit.file {
                        *per_file.entry(file).or_insert(0) += 1;
                    }
                }
            }
        }

        if bound == 0 {
            return Ok(Vec::new());
        }

        tx.execute(
            "UPDATE workflows SET units_running = units_running + ?1 WHERE id=?2",
            params![bound, slot.id],
        )?;
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE files_{label} SET units_running = units_running + ?1 WHERE id=?2"
            ))?;
            for (file, count) in &per_file {
                stmt.execute(params![count, file])?;
            }
        }

        self.store.refresh_stats(tx, label)?;

        Ok(descriptors)
    }

    fn insert_task(
        &self,
        tx: &Connection,
        slot: &WorkflowSlot,
        files: Vec<(i64, String)>,
        units: Vec<UnitSpec>,
        arg: Option<String>,
    ) -> Result<TaskDescriptor> {
        tx.execute(
            "INSERT INTO tasks (workflow, status, type) VALUES (?1, 1, 0)",
            params![slot.id],
        )?;
        Ok(TaskDescriptor {
            id: tx.last_insert_rowid(),
            label: slot.label.clone(),
            files,
            units,
            arg,
            empty_source: slot.empty_source,
            merge: false,
        })
    }

    fn filename(
        &self,
        tx: &Connection,
        label: &str,
        cache: &mut HashMap<i64, String>,
        file: i64,
    ) -> Result<String> {
        if let Some(name) = cache.get(&file) {
            return Ok(name.clone());
        }
        let name: String = tx.query_row(
            &format!("SELECT filename FROM files_{label} WHERE id=?1"),
            params![file],
            |row| row.get(0),
        )?;
        cache.insert(file, name.clone());
        Ok(name)
    }

    fn filenames_for(
        &self,
        tx: &Connection,
        label: &str,
        cache: &mut HashMap<i64, String>,
        files: &BTreeSet<i64>,
    ) -> Result<Vec<(i64, String)>> {
        files
            .iter()
            .map(|&file| Ok((file, self.filename(tx, label, cache, file)?)))
            .collect()
    }

    /// Create up to `num` merge tasks with at most `max_bytes` of bare
    /// output each.
    ///
    /// A workflow qualifies once at least 10% of its units are done or
    /// paused and it has successful processing tasks to combine. Bins below
    /// 90% of the budget are held back until the workflow has drained, so
    /// early merges stay close to the target size.
    pub fn pop_merge(&self, max_bytes: i64, num: usize) -> Result<Vec<TaskDescriptor>> {
        if max_bytes <= 0 {
            return Ok(Vec::new());
        }

        let mut rows: Vec<(String, i64, bool)> = {
            let conn = self.store.lock_conn()?;
            let mut stmt = conn.prepare(
                "SELECT label, id, units_done + units_paused = units
                 FROM workflows
                 WHERE merged <> 1
                   AND (units_done + units_paused) * 10 >= units
                   AND (SELECT count(*) FROM tasks
                        WHERE workflow=workflows.id AND status=2) > 0",
            )?;
            let mapped = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            mapped.collect::<std::result::Result<_, _>>()?
        };

        if rows.is_empty() {
            debug!("no merge possibility found");
            return Ok(Vec::new());
        }

        self.shuffle(&mut rows);

        let mut result = Vec::new();
        for (label, id, complete) in rows {
            result.extend(self.pop_workflow_merge(&label, id, complete, max_bytes)?);
            if result.len() > num {
                break;
            }
        }
        Ok(result)
    }

    fn pop_workflow_merge(
        &self,
        label: &str,
        workflow_id: i64,
        complete: bool,
        max_bytes: i64,
    ) -> Result<Vec<TaskDescriptor>> {
        debug!(workflow = label, "trying to merge tasks");

        with_retry(|| {
            let mut conn = self.store.lock_conn()?;
            let tx = conn.transaction()?;

            let rows: Vec<(i64, i64, i64)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, units, bytes_bare_output FROM tasks
                     WHERE status=2 AND workflow=?1 AND type=0
                     ORDER BY bytes_bare_output DESC",
                )?;
                let mapped = stmt.query_map(params![workflow_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                mapped.collect::<std::result::Result<_, _>>()?
            };

            // Without two tasks, or if even the two smallest outputs do not
            // fit the budget together, skip straight to the completion
            // check.
            let feasible =
                rows.len() >= 2 && rows[rows.len() - 2].2 + rows[rows.len() - 1].2 <= max_bytes;

            let mut bins: Vec<MergeBin> = Vec::new();
            if feasible {
                let minsize = rows[rows.len() - 1].2;
                for (task, units, size) in rows {
                    // fullest bin first
                    bins.sort_by(|a, b| b.size.cmp(&a.size));
                    let placed = bins
                        .iter_mut()
                        .any(|bin| bin.add(task, units, size, max_bytes));
                    if !placed && size + minsize <= max_bytes {
                        bins.push(MergeBin::new(task, units, size));
                    }
                }
            }

            bins.sort_by(|a, b| b.size.cmp(&a.size));
            let merges: Vec<MergeBin> = bins
                .into_iter()
                .filter(|bin| {
                    bin.tasks.len() >= 2
                        && (complete || bin.size as f64 >= max_bytes as f64 * MERGE_FILL_GATE)
                })
                .collect();

            debug!(workflow = label, merges = merges.len(), "created merge tasks");

            if merges.is_empty() && complete {
                let assigned: i64 = tx.query_row(
                    "SELECT count(*) FROM tasks WHERE status=1 AND workflow=?1",
                    params![workflow_id],
                    |row| row.get(0),
                )?;
                if assigned == 0 {
                    debug!(workflow = label, "fully merged");
                    tx.execute(
                        "UPDATE workflows SET merged=1 WHERE id=?1",
                        params![workflow_id],
                    )?;
                    tx.commit()?;
                    return Ok(Vec::new());
                }
            }

            let mut result = Vec::new();
            for merge in &merges {
                tx.execute(
                    "INSERT INTO tasks (workflow, units, status, type) VALUES (?1, ?2, 1, 1)",
                    params![workflow_id, merge.units],
                )?;
                let merge_id = tx.last_insert_rowid();
                debug!(merge_id, constituents = merge.tasks.len(), "inserted merge task");

                for task in &merge.tasks {
                    tx.execute(
                        "UPDATE tasks SET status=7, task=?1 WHERE id=?2",
                        params![merge_id, task],
                    )?;
                }

                result.push(TaskDescriptor {
                    id: merge_id,
                    label: label.to_string(),
                    files: Vec::new(),
                    units: merge
                        .tasks
                        .iter()
                        .map(|&task| UnitSpec {
                            id: task,
                            file: None,
                            run: -1,
                            lumi: -1,
                        })
                        .collect(),
                    arg: None,
                    empty_source: false,
                    merge: true,
                });
            }

            self.store.refresh_stats(&tx, label)?;
            tx.commit()?;
            Ok(result)
        })
    }
}
