//! Core data models for the lumiflow work-unit scheduler

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Executor result code signalling a clean run.
pub const EXECUTOR_SUCCESS: i64 = 0;

/// Lifecycle states shared by units and tasks.
///
/// The same integer domain is persisted for both: a unit and the task it is
/// bound to move through the same state machine, with the merge states only
/// ever reached by processing tasks and their units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Initialized = 0,
    Assigned = 1,
    Successful = 2,
    Failed = 3,
    Aborted = 4,
    Published = 6,
    Merging = 7,
    Merged = 8,
}

impl Status {
    pub fn from_i64(value: i64) -> Option<Status> {
        match value {
            0 => Some(Status::Initialized),
            1 => Some(Status::Assigned),
            2 => Some(Status::Successful),
            3 => Some(Status::Failed),
            4 => Some(Status::Aborted),
            6 => Some(Status::Published),
            7 => Some(Status::Merging),
            8 => Some(Status::Merged),
            _ => None,
        }
    }
}

impl ToSql for Status {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok((*self as i64).into())
    }
}

impl FromSql for Status {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_i64()?;
        Status::from_i64(raw).ok_or(FromSqlError::OutOfRange(raw))
    }
}

/// Task kind: a processing task runs units, a merge task combines the
/// outputs of already successful processing tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Process = 0,
    Merge = 1,
}

impl ToSql for TaskType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok((*self as i64).into())
    }
}

impl FromSql for TaskType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_i64()? {
            0 => Ok(TaskType::Process),
            1 => Ok(TaskType::Merge),
            other => Err(FromSqlError::OutOfRange(other)),
        }
    }
}

/// One input file of a dataset, as supplied by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetFile {
    pub filename: String,
    /// (run, lumi) pairs contained in this file. File-based datasets carry a
    /// single `(-1, -1)` entry per file.
    pub lumis: Vec<(i64, i64)>,
    pub events: i64,
    pub bytes: i64,
}

/// Dataset inventory handed over by discovery at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub path: String,
    pub files: Vec<DatasetFile>,
    pub total_lumis: i64,
    pub masked_lumis: i64,
    pub total_events: i64,
    /// Initial target units per task.
    pub tasksize: i64,
    pub file_based: bool,
    pub empty_source: bool,
}

/// The finest schedulable element as carried inside a task descriptor.
///
/// For merge tasks `id` is a constituent processing-task id, `file` is
/// absent and run/lumi are -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitSpec {
    pub id: i64,
    pub file: Option<i64>,
    pub run: i64,
    pub lumi: i64,
}

/// A ready-to-dispatch task produced by the scheduler.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub id: i64,
    pub label: String,
    /// (file id, filename) of every input file covered by the task.
    pub files: Vec<(i64, String)>,
    pub units: Vec<UnitSpec>,
    pub arg: Option<String>,
    pub empty_source: bool,
    pub merge: bool,
}

/// Which table the unit-level rows of an update batch live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitSource {
    /// Merge-task updates: the "units" are rows of the global tasks table.
    Tasks,
    /// Processing-task updates: rows of the per-workflow units table.
    Units,
}

impl UnitSource {
    pub(crate) fn table(&self, label: &str) -> String {
        match self {
            UnitSource::Tasks => "tasks".to_string(),
            UnitSource::Units => format!("units_{}", label),
        }
    }
}

/// Completion metrics for one task, written back to the tasks table.
///
/// Every field maps to a column of the same name; `COLUMNS` lists them once
/// and the store builds its UPDATE statement from that list, with the
/// trailing `id` as the key.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub bytes_bare_output: i64,
    pub bytes_output: i64,
    pub bytes_received: i64,
    pub bytes_sent: i64,
    pub cache: i64,
    pub cache_end_size: i64,
    pub cache_start_size: i64,
    pub exit_code: i64,
    pub events_read: i64,
    pub events_written: i64,
    pub host: String,
    pub units_processed: i64,
    pub limits_exceeded: String,
    pub memory_resident: i64,
    pub memory_swap: i64,
    pub memory_virtual: i64,
    pub status: Status,
    pub submissions: i64,
    pub time_submit: i64,
    pub time_transfer_in_start: i64,
    pub time_transfer_in_end: i64,
    pub time_wrapper_start: i64,
    pub time_wrapper_ready: i64,
    pub time_stage_in_end: i64,
    pub time_prologue_end: i64,
    pub time_file_requested: i64,
    pub time_file_opened: i64,
    pub time_file_processing: i64,
    pub time_processing_end: i64,
    pub time_epilogue_end: i64,
    pub time_stage_out_end: i64,
    pub time_transfer_out_start: i64,
    pub time_transfer_out_end: i64,
    pub time_retrieved: i64,
    pub time_on_worker: i64,
    pub time_total_on_worker: i64,
    pub time_cpu: i64,
    pub workdir_footprint: i64,
    pub workdir_num_files: i64,
    pub id: i64,
}

impl TaskUpdate {
    /// Metric columns, in the order `sql_params` yields their values.
    pub(crate) const COLUMNS: [&'static str; 39] = [
        "bytes_bare_output",
        "bytes_output",
        "bytes_received",
        "bytes_sent",
        "cache",
        "cache_end_size",
        "cache_start_size",
        "exit_code",
        "events_read",
        "events_written",
        "host",
        "units_processed",
        "limits_exceeded",
        "memory_resident",
        "memory_swap",
        "memory_virtual",
        "status",
        "submissions",
        "time_submit",
        "time_transfer_in_start",
        "time_transfer_in_end",
        "time_wrapper_start",
        "time_wrapper_ready",
        "time_stage_in_end",
        "time_prologue_end",
        "time_file_requested",
        "time_file_opened",
        "time_file_processing",
        "time_processing_end",
        "time_epilogue_end",
        "time_stage_out_end",
        "time_transfer_out_start",
        "time_transfer_out_end",
        "time_retrieved",
        "time_on_worker",
        "time_total_on_worker",
        "time_cpu",
        "workdir_footprint",
        "workdir_num_files",
    ];

    /// Values for `COLUMNS`, followed by the row key.
    pub(crate) fn sql_params(&self) -> [&dyn ToSql; 40] {
        [
            &self.bytes_bare_output,
            &self.bytes_output,
            &self.bytes_received,
            &self.bytes_sent,
            &self.cache,
            &self.cache_end_size,
            &self.cache_start_size,
            &self.exit_code,
            &self.events_read,
            &self.events_written,
            &self.host,
            &self.units_processed,
            &self.limits_exceeded,
            &self.memory_resident,
            &self.memory_swap,
            &self.memory_virtual,
            &self.status,
            &self.submissions,
            &self.time_submit,
            &self.time_transfer_in_start,
            &self.time_transfer_in_end,
            &self.time_wrapper_start,
            &self.time_wrapper_ready,
            &self.time_stage_in_end,
            &self.time_prologue_end,
            &self.time_file_requested,
            &self.time_file_opened,
            &self.time_file_processing,
            &self.time_processing_end,
            &self.time_epilogue_end,
            &self.time_stage_out_end,
            &self.time_transfer_out_start,
            &self.time_transfer_out_end,
            &self.time_retrieved,
            &self.time_on_worker,
            &self.time_total_on_worker,
            &self.time_cpu,
            &self.workdir_footprint,
            &self.workdir_num_files,
            &self.id,
        ]
    }
}

/// Per-file counter adjustment derived from one task report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDelta {
    pub events_read: i64,
    /// 1 if the file was skipped by the wrapper, else 0.
    pub skipped: i64,
    pub file: i64,
}

/// Selective status overlay for a single unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitStatusUpdate {
    pub status: Status,
    pub unit: i64,
}

/// Everything the task handler derived from one completed task.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub task: TaskUpdate,
    pub files: Vec<FileDelta>,
    pub units: Vec<UnitStatusUpdate>,
}

/// One `update_units` batch: all outcomes sharing a workflow and a unit
/// source are applied in a single transaction section.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    pub label: String,
    pub source: UnitSource,
    pub outcomes: Vec<TaskOutcome>,
}

/// Resource measurements attached to an executor completion record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceReport {
    pub workdir_num_files: i64,
    pub workdir_footprint: i64,
    pub limits_exceeded: String,
    pub resident_memory: i64,
    pub swap_memory: i64,
    pub virtual_memory: i64,
}

/// What the worker-pool executor hands back for a finished task.
///
/// All times are microseconds since the epoch; the store keeps seconds.
/// `resources_measured` may be absent when the worker did not report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// The task id assigned at dispatch.
    pub tag: i64,
    pub hostname: String,
    /// Wrapper exit status.
    pub return_status: i64,
    /// Executor-level result code; 0 means the executor saw a clean run.
    pub result: i64,
    /// Wrapper stdout, if captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<u8>>,
    pub total_submissions: i64,
    pub total_bytes_received: i64,
    pub total_bytes_sent: i64,
    pub submit_time: i64,
    pub send_input_start: i64,
    pub send_input_finish: i64,
    pub receive_output_start: i64,
    pub receive_output_finish: i64,
    pub finish_time: i64,
    pub cmd_execution_time: i64,
    pub total_cmd_execution_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources_measured: Option<ResourceReport>,
}

/// Configuration snapshot of a registered workflow.
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub dataset: String,
    pub path: String,
    pub release: String,
    pub global_tag: Option<String>,
    pub publish_label: String,
    pub cfg: Option<String>,
    pub pset_hash: Option<String>,
    pub id: i64,
    pub uuid: String,
}

/// One row of the per-workflow progress overview.
#[derive(Debug, Clone)]
pub struct WorkflowProgress {
    pub label: String,
    pub events: i64,
    pub events_read: i64,
    pub events_written: i64,
    /// Units plus the lumis removed by the mask.
    pub total_units: i64,
    pub units: i64,
    pub units_done: i64,
    pub units_paused: i64,
    pub percent: f64,
}
