use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use log::info;
use serde::{Deserialize, Serialize};

use crate::Result;

const SUMMARY_FILE: &str = "summaries.jsonl";

/// Persists evaluation results.
pub trait SummaryWriter: Send {
    /// Saves the values of `metrics` computed at global step `step`.
    ///
    /// # Arguments
    /// * `dir` - The working directory of the estimator.
    /// * `step` - The global step the values were computed at.
    /// * `metrics` - The names of the metrics.
    /// * `values` - The value of every metric, in the same order.
    /// * `name` - An optional tag telling evaluations apart.
    fn save(
        &mut self,
        dir: &Path,
        step: u64,
        metrics: &[&str],
        values: &[f32],
        name: Option<&str>,
    ) -> Result<()>;
}

/// One line of the summaries file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub step: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    pub metrics: BTreeMap<String, f32>,
}

/// Appends every summary as a JSON line to `<dir>/summaries.jsonl`.
#[derive(Debug, Clone, Default)]
pub struct JsonSummaryWriter;

impl JsonSummaryWriter {
    pub fn new() -> Self {
        Self
    }

    /// The file summaries are appended to within `dir`.
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(SUMMARY_FILE)
    }

    /// Reads back every record saved in `dir`.
    pub fn read(dir: &Path) -> Result<Vec<SummaryRecord>> {
        let contents = fs::read_to_string(Self::path(dir))?;

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    }
}

impl SummaryWriter for JsonSummaryWriter {
    fn save(
        &mut self,
        dir: &Path,
        step: u64,
        metrics: &[&str],
        values: &[f32],
        name: Option<&str>,
    ) -> Result<()> {
        for (metric, value) in metrics.iter().zip(values) {
            info!(step = step, metric = *metric, value = *value; "evaluation summary");
        }

        let record = SummaryRecord {
            step,
            name: name.map(str::to_string),
            metrics: metrics
                .iter()
                .zip(values)
                .map(|(metric, value)| (metric.to_string(), *value))
                .collect(),
        };

        fs::create_dir_all(dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::path(dir))?;

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }
}
