//! YAML configuration with validation for the store and its workflows

use crate::error::{LumiflowError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_threshold() -> i64 {
    10
}

/// Store-level configuration.
///
/// `workdir` hosts the database file; the two thresholds gate when failing
/// units and skipping files are paused (excluded from scheduling).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub workdir: PathBuf,
    #[serde(rename = "threshold for failure", default = "default_threshold")]
    pub failure_threshold: i64,
    #[serde(rename = "threshold for skipping", default = "default_threshold")]
    pub skipping_threshold: i64,
}

impl StoreConfig {
    pub fn new<P: AsRef<Path>>(workdir: P) -> Self {
        Self {
            workdir: workdir.as_ref().to_path_buf(),
            failure_threshold: default_threshold(),
            skipping_threshold: default_threshold(),
        }
    }

    /// Parse a store configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Read and parse a store configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }
}

/// Identity and argument fan-out of one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(rename = "cmssw config", skip_serializing_if = "Option::is_none")]
    pub cmssw_config: Option<String>,
    #[serde(rename = "global tag", skip_serializing_if = "Option::is_none")]
    pub global_tag: Option<String>,
    #[serde(rename = "publish label", skip_serializing_if = "Option::is_none")]
    pub publish_label: Option<String>,
    #[serde(default)]
    pub release: String,
    /// Each entry multiplies the logical units of the dataset: every file's
    /// lumi set is inserted once per argument.
    #[serde(rename = "unique parameters", default)]
    pub unique_parameters: Vec<String>,
}

impl WorkflowConfig {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            dataset: None,
            cmssw_config: None,
            global_tag: None,
            publish_label: None,
            release: String::new(),
            unique_parameters: Vec::new(),
        }
    }

    /// Parse a workflow configuration from a YAML string and validate its
    /// label.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: WorkflowConfig = serde_yaml::from_str(content)?;
        validate_label(&config.label)?;
        Ok(config)
    }

    /// Read and parse a workflow configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    /// The dataset name, falling back to the label.
    pub fn dataset_name(&self) -> &str {
        self.dataset.as_deref().unwrap_or(&self.label)
    }

    /// The publish label with dashes replaced by underscores, falling back
    /// to the workflow label.
    pub fn sanitized_publish_label(&self) -> String {
        self.publish_label
            .as_deref()
            .unwrap_or(&self.label)
            .replace('-', "_")
    }

    /// Argument fan-out: the configured parameters, or a single empty slot
    /// when none are configured.
    pub fn argument_slots(&self) -> Vec<Option<String>> {
        if self.unique_parameters.is_empty() {
            vec![None]
        } else {
            self.unique_parameters.iter().cloned().map(Some).collect()
        }
    }
}

/// Validate a workflow label.
///
/// Labels are spliced into the per-workflow table names, so they are
/// restricted to an identifier charset: a leading letter followed by
/// letters, digits and underscores.
pub fn validate_label(label: &str) -> Result<()> {
    let mut chars = label.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphabetic()
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(LumiflowError::InvalidLabel(label.to_string()))
    }
}
