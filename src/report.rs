//! Parser for the wrapper's per-task `report.json`

use crate::error::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Name of the report document inside a task directory.
pub const REPORT_FILE: &str = "report.json";

/// Per-file outcome: events read and the (run, lumi) pairs actually
/// processed out of this file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry(pub i64, pub Vec<(i64, i64)>);

/// The `files` section, present only for cmssw tasks.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileSection {
    #[serde(default)]
    pub info: HashMap<String, FileEntry>,
    #[serde(default)]
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheReport {
    #[serde(rename = "type")]
    pub kind: i64,
    #[serde(rename = "start size")]
    pub start_size: i64,
    #[serde(rename = "end size")]
    pub end_size: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskTiming {
    #[serde(rename = "wrapper start")]
    pub wrapper_start: i64,
    #[serde(rename = "wrapper ready")]
    pub wrapper_ready: i64,
    #[serde(rename = "stage in end")]
    pub stage_in_end: i64,
    #[serde(rename = "prologue end")]
    pub prologue_end: i64,
    #[serde(rename = "file requested")]
    pub file_requested: i64,
    #[serde(rename = "file opened")]
    pub file_opened: i64,
    #[serde(rename = "file processing")]
    pub file_processing: i64,
    #[serde(rename = "processing end")]
    pub processing_end: i64,
    #[serde(rename = "epilogue end")]
    pub epilogue_end: i64,
    #[serde(rename = "stage out end")]
    pub stage_out_end: i64,
}

/// Summary written by the wrapper into each task directory.
///
/// The `files`, `events written` and `cmssw exit code` keys only appear for
/// cmssw tasks; everything else is always present.
#[derive(Debug, Clone, Deserialize)]
pub struct WrapperReport {
    #[serde(rename = "output size")]
    pub output_size: i64,
    #[serde(rename = "output bare size")]
    pub output_bare_size: i64,
    pub cache: CacheReport,
    #[serde(rename = "task timing")]
    pub timing: TaskTiming,
    #[serde(rename = "cpu time")]
    pub cpu_time: f64,
    #[serde(default)]
    pub files: Option<FileSection>,
    #[serde(rename = "events written", default)]
    pub events_written: Option<i64>,
    #[serde(rename = "cmssw exit code", default)]
    pub cmssw_exit_code: Option<i64>,
}

impl WrapperReport {
    /// Parse a report from a JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Read `report.json` from a task directory.
    pub fn load<P: AsRef<Path>>(taskdir: P) -> Result<Self> {
        Self::from_json(&fs::read_to_string(taskdir.as_ref().join(REPORT_FILE))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"{
        "output size": 2048,
        "output bare size": 1024,
        "cache": {"type": 1, "start size": 100, "end size": 250},
        "task timing": {
            "wrapper start": 1000,
            "wrapper ready": 1005,
            "stage in end": 1010,
            "prologue end": 1020,
            "file requested": 1021,
            "file opened": 1023,
            "file processing": 1025,
            "processing end": 1200,
            "epilogue end": 1210,
            "stage out end": 1215
        },
        "cpu time": 180.5,
        "files": {
            "info": {
                "input_a.root": [500, [[1, 5], [1, 6]]],
                "input_b.root": [300, [[1, 7]]]
            },
            "skipped": ["input_c.root"]
        },
        "events written": 750,
        "cmssw exit code": 0
    }"#;

    #[test]
    fn test_parse_full_report() {
        let report = WrapperReport::from_json(SAMPLE).unwrap();
        assert_eq!(report.output_size, 2048);
        assert_eq!(report.output_bare_size, 1024);
        assert_eq!(report.cache.kind, 1);
        assert_eq!(report.timing.stage_in_end, 1010);
        assert_eq!(report.timing.epilogue_end, 1210);
        assert_eq!(report.cpu_time, 180.5);

        let files = report.files.unwrap();
        assert_eq!(files.info["input_a.root"].0, 500);
        assert_eq!(files.info["input_a.root"].1, vec![(1, 5), (1, 6)]);
        assert_eq!(files.skipped, vec!["input_c.root"]);
        assert_eq!(report.events_written, Some(750));
        assert_eq!(report.cmssw_exit_code, Some(0));
    }

    #[test]
    fn test_parse_non_cmssw_report() {
        let json = r#"{
            "output size": 10,
            "output bare size": 5,
            "cache": {"type": 0, "start size": 0, "end size": 0},
            "task timing": {
                "wrapper start": 1, "wrapper ready": 2, "stage in end": 3,
                "prologue end": 4, "file requested": 5, "file opened": 6,
                "file processing": 7, "processing end": 8, "epilogue end": 9,
                "stage out end": 10
            },
            "cpu time": 4
        }"#;
        let report = WrapperReport::from_json(json).unwrap();
        assert!(report.files.is_none());
        assert_eq!(report.events_written, None);
        assert_eq!(report.cmssw_exit_code, None);
    }

    #[test]
    fn test_truncated_report_fails() {
        assert!(WrapperReport::from_json("{\"output size\": 1").is_err());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(WrapperReport::load(dir.path()).is_err());
    }
}
