//! Per-task adapter between the scheduler, the executor and the store
//!
//! A `TaskHandler` is constructed from a task descriptor when the task is
//! dispatched. It parameterizes the dispatch request (`adjust`) and later
//! ingests the executor's completion record together with the wrapper's
//! on-disk report (`process`), producing the status deltas the store
//! consumes. The stage engine and the run summary are seams: the handler
//! only talks to them through traits.

use crate::error::Result;
use crate::models::{
    CompletionRecord, FileDelta, Status, TaskDescriptor, TaskOutcome, TaskUpdate, UnitSource,
    UnitSpec, UnitStatusUpdate, EXECUTOR_SUCCESS,
};
use crate::report::{FileSection, WrapperReport};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::error;

/// Executor exit codes are offset by this much when the executor itself,
/// not the wrapper, reported the failure.
const EXECUTOR_EXIT_OFFSET: i64 = 100_000;

/// Name of the compressed wrapper log kept in each task directory.
pub const TASK_LOG: &str = "task.log.gz";

/// A file staged in or out of the worker sandbox:
/// (source path, name inside the sandbox, cacheable).
pub type StagedFile = (String, String, bool);

/// Stage-in/stage-out policy seam.
pub trait StageEngine {
    fn transfer_inputs(&self) -> bool;
    fn transfer_outputs(&self) -> bool;
    /// Map a logical path onto the locally reachable one.
    fn local(&self, path: &str) -> String;
}

/// Sink for the per-task bookkeeping of the result loop.
pub trait ReportSummary {
    /// The executor itself reported a failure.
    fn executor_failure(&mut self, code: i64, task: i64);
    /// The wrapper ran to completion with this exit code.
    fn wrapper_exit(&mut self, exit_code: i64, task: i64);
    /// The executor record carried no resource measurements.
    fn monitor_lost(&mut self, task: i64);
}

/// Input mask handed to the wrapper.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Mask {
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lumis: Option<BTreeMap<i64, Vec<(i64, i64)>>>,
}

/// Dispatch request parameters the handler fills in.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskParameters {
    pub mask: Mask,
    #[serde(rename = "output files")]
    pub output_files: Vec<(String, String)>,
}

/// Everything `process_report` extracts beyond the generic metrics.
#[derive(Debug, Clone, Default)]
struct CmsswStats {
    files: FileSection,
    events_written: i64,
    exit_code: Option<i64>,
}

/// Handles mapping of units to files and results back to status deltas for
/// one task.
pub struct TaskHandler {
    id: i64,
    dataset: String,
    files: Vec<(i64, String)>,
    units: Vec<UnitSpec>,
    outputs: Vec<(String, String)>,
    taskdir: PathBuf,
    cmssw_task: bool,
    empty_source: bool,
    merge: bool,
    local: bool,
    file_based: bool,
}

impl TaskHandler {
    /// Build a handler for a dispatched task.
    ///
    /// `outputs` pairs each local output file with its remote destination.
    pub fn new<P: AsRef<Path>>(
        descriptor: &TaskDescriptor,
        outputs: Vec<(String, String)>,
        taskdir: P,
        cmssw_task: bool,
        local: bool,
    ) -> Self {
        let file_based = descriptor
            .units
            .iter()
            .any(|unit| unit.run < 0 || unit.lumi < 0);

        Self {
            id: descriptor.id,
            dataset: descriptor.label.clone(),
            files: descriptor.files.clone(),
            units: descriptor.units.clone(),
            outputs,
            taskdir: taskdir.as_ref().to_path_buf(),
            cmssw_task,
            empty_source: descriptor.empty_source,
            merge: descriptor.merge,
            local,
            file_based,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn merge(&self) -> bool {
        self.merge
    }

    /// Which table this task's unit updates belong to.
    pub fn unit_source(&self) -> UnitSource {
        if self.merge {
            UnitSource::Tasks
        } else {
            UnitSource::Units
        }
    }

    /// Unique input filenames of this task.
    pub fn input_files(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.files
            .iter()
            .filter(|(_, filename)| !filename.is_empty())
            .filter_map(|(_, filename)| {
                seen.insert(filename.clone()).then(|| filename.clone())
            })
            .collect()
    }

    /// Parameterize the dispatch request.
    ///
    /// Local and merge tasks read their inputs through the stage engine's
    /// local paths; outputs are rewritten likewise when the engine
    /// transfers them. Lumi-granular tasks additionally get a compact lumi
    /// mask.
    pub fn adjust(
        &self,
        parameters: &mut TaskParameters,
        inputs: &mut Vec<StagedFile>,
        outputs: &mut Vec<(String, String)>,
        engine: &dyn StageEngine,
    ) {
        let local = self.local || self.merge;
        if local && engine.transfer_inputs() {
            inputs.extend(
                self.files
                    .iter()
                    .filter(|(_, filename)| !filename.is_empty())
                    .map(|(_, filename)| {
                        (engine.local(filename), basename(filename), false)
                    }),
            );
        }
        if engine.transfer_outputs() {
            outputs.extend(
                self.outputs
                    .iter()
                    .map(|(local_file, remote_file)| {
                        (engine.local(remote_file), basename(local_file))
                    }),
            );
        }

        parameters.mask.files = self.input_files();
        parameters.output_files = self.outputs.clone();
        if !self.file_based && !self.merge {
            parameters.mask.lumis = Some(compact_lumis(&self.units));
        }
    }

    /// Ingest a completed task.
    ///
    /// Persists the wrapper log, reads the report, reconciles the
    /// executor's own verdict and computes the unit-level deltas. Returns
    /// the failure flag together with the outcome the store consumes. Only
    /// a failure to persist the log surfaces as an error; a broken report
    /// marks the task FAILED instead.
    pub fn process(
        &self,
        record: &CompletionRecord,
        summary: &mut dyn ReportSummary,
    ) -> Result<(bool, TaskOutcome)> {
        let mut failed = record.return_status != 0;
        let mut update = TaskUpdate {
            id: self.id,
            ..Default::default()
        };

        if let Some(output) = &record.output {
            self.write_log(output)?;
        }

        let mut exit_code = record.return_status;
        let stats = match self.process_report(&mut update) {
            Ok(stats) => stats,
            Err(err) => {
                failed = true;
                error!(task = self.id, error = %err, "error processing report");
                CmsswStats::default()
            }
        };

        if record.result != EXECUTOR_SUCCESS {
            exit_code = EXECUTOR_EXIT_OFFSET + record.result;
            failed = true;
            summary.executor_failure(record.result, self.id);
        } else {
            if let Some(code) = stats.exit_code {
                if code != 0 {
                    exit_code = code;
                    if code > 0 {
                        failed = true;
                    }
                }
            }
            summary.wrapper_exit(exit_code, self.id);
        }
        update.exit_code = exit_code;

        let (files, units) = self.unit_deltas(failed, &mut update, &stats);
        self.record_resources(record, &mut update, summary);

        Ok((
            failed,
            TaskOutcome {
                task: update,
                files,
                units,
            },
        ))
    }

    /// Read the report summary written by the wrapper.
    fn process_report(&self, update: &mut TaskUpdate) -> Result<CmsswStats> {
        let report = WrapperReport::load(&self.taskdir)?;

        update.bytes_output = report.output_size;
        update.bytes_bare_output = report.output_bare_size;
        update.cache = report.cache.kind;
        update.cache_end_size = report.cache.end_size;
        update.cache_start_size = report.cache.start_size;
        update.time_wrapper_start = report.timing.wrapper_start;
        update.time_wrapper_ready = report.timing.wrapper_ready;
        update.time_stage_in_end = report.timing.stage_in_end;
        update.time_prologue_end = report.timing.prologue_end;
        update.time_file_requested = report.timing.file_requested;
        update.time_file_opened = report.timing.file_opened;
        update.time_file_processing = report.timing.file_processing;
        update.time_processing_end = report.timing.processing_end;
        update.time_epilogue_end = report.timing.epilogue_end;
        update.time_stage_out_end = report.timing.stage_out_end;
        update.time_cpu = report.cpu_time.round() as i64;

        if self.cmssw_task {
            Ok(CmsswStats {
                files: report.files.unwrap_or_default(),
                events_written: report.events_written.unwrap_or(0),
                exit_code: report.cmssw_exit_code,
            })
        } else {
            Ok(CmsswStats::default())
        }
    }

    /// Compute the per-file and per-unit deltas for this task's result.
    fn unit_deltas(
        &self,
        failed: bool,
        update: &mut TaskUpdate,
        stats: &CmsswStats,
    ) -> (Vec<FileDelta>, Vec<UnitStatusUpdate>) {
        let mut events_read = 0;
        let mut files = Vec::new();
        let mut units = Vec::new();
        let mut units_processed = self.units.len() as i64;

        for (file_id, filename) in &self.files {
            let file_units = self
                .units
                .iter()
                .filter(|unit| unit.file == Some(*file_id));

            let mut skipped = false;
            let mut read = 0;
            if self.cmssw_task && !self.empty_source {
                skipped = stats.files.skipped.contains(filename)
                    || !stats.files.info.contains_key(filename);
                if !failed && !skipped {
                    read = stats.files.info[filename].0;
                }
            }

            events_read += read;

            if failed {
                units_processed = 0;
            } else if skipped {
                for unit in file_units {
                    units.push(UnitStatusUpdate {
                        status: Status::Failed,
                        unit: unit.id,
                    });
                    units_processed -= 1;
                }
            } else if !self.file_based {
                if let Some(entry) = stats.files.info.get(filename) {
                    let processed: HashSet<(i64, i64)> = entry.1.iter().copied().collect();
                    for unit in file_units {
                        if !processed.contains(&(unit.run, unit.lumi)) {
                            units.push(UnitStatusUpdate {
                                status: Status::Failed,
                                unit: unit.id,
                            });
                            units_processed -= 1;
                        }
                    }
                }
            }

            files.push(FileDelta {
                events_read: read,
                skipped: skipped as i64,
                file: *file_id,
            });
        }

        update.events_read = events_read;
        update.events_written = if failed { 0 } else { stats.events_written };
        update.units_processed = units_processed;
        update.status = if failed {
            Status::Failed
        } else {
            Status::Successful
        };

        if self.merge {
            files = Vec::new();
        }

        (files, units)
    }

    /// Copy the executor's resource metrics into the task update.
    fn record_resources(
        &self,
        record: &CompletionRecord,
        update: &mut TaskUpdate,
        summary: &mut dyn ReportSummary,
    ) {
        update.host = record.hostname.clone();
        update.submissions = record.total_submissions;
        update.bytes_received = record.total_bytes_received;
        update.bytes_sent = record.total_bytes_sent;
        update.time_submit = record.submit_time / 1_000_000;
        update.time_transfer_in_start = record.send_input_start / 1_000_000;
        update.time_transfer_in_end = record.send_input_finish / 1_000_000;
        update.time_transfer_out_start = record.receive_output_start / 1_000_000;
        update.time_transfer_out_end = record.receive_output_finish / 1_000_000;
        update.time_retrieved = record.finish_time / 1_000_000;
        update.time_on_worker = record.cmd_execution_time / 1_000_000;
        update.time_total_on_worker = record.total_cmd_execution_time / 1_000_000;

        match &record.resources_measured {
            Some(resources) => {
                update.workdir_num_files = resources.workdir_num_files;
                update.workdir_footprint = resources.workdir_footprint;
                update.limits_exceeded = resources.limits_exceeded.clone();
                update.memory_resident = resources.resident_memory;
                update.memory_swap = resources.swap_memory;
                update.memory_virtual = resources.virtual_memory;
            }
            None => summary.monitor_lost(self.id),
        }
    }

    /// Persist the wrapper's stdout as a compressed log in the task
    /// directory.
    fn write_log(&self, output: &[u8]) -> Result<()> {
        let file = File::create(self.taskdir.join(TASK_LOG))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(output)?;
        encoder.finish()?;
        Ok(())
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
        .to_string()
}

/// Collapse a unit set into per-run lumi ranges.
fn compact_lumis(units: &[UnitSpec]) -> BTreeMap<i64, Vec<(i64, i64)>> {
    let mut by_run: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    for unit in units {
        by_run.entry(unit.run).or_default().insert(unit.lumi);
    }

    by_run
        .into_iter()
        .map(|(run, lumis)| {
            let mut ranges: Vec<(i64, i64)> = Vec::new();
            for lumi in lumis {
                match ranges.last_mut() {
                    Some((_, end)) if *end + 1 == lumi => *end = lumi,
                    _ => ranges.push((lumi, lumi)),
                }
            }
            (run, ranges)
        })
        .collect()
}
