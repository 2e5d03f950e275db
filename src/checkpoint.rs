use std::{
    fs,
    path::{Path, PathBuf},
};

use engine::Snapshot;
use log::{debug, info};

use crate::Result;

const PREFIX: &str = "checkpoint-";
const EXTENSION: &str = "json";

/// Persists and restores session snapshots.
pub trait Checkpointer: Send {
    /// Saves `snapshot`, taken at global step `step`.
    ///
    /// # Returns
    /// Where the checkpoint was written.
    fn save(&mut self, step: u64, snapshot: &Snapshot) -> Result<PathBuf>;

    /// Loads the most recent checkpoint, `None` if there is none.
    fn restore_latest(&self) -> Result<Option<Snapshot>>;
}

/// Writes every snapshot to `<dir>/checkpoint-<step>.json`, keeping only the
/// most recent ones.
#[derive(Debug, Clone)]
pub struct JsonCheckpointer {
    dir: PathBuf,
    keep: usize,
}

impl JsonCheckpointer {
    /// Creates a new `JsonCheckpointer` keeping the last 5 checkpoints.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            keep: 5,
        }
    }

    /// Keeps the last `keep` checkpoints, at least one.
    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lists the checkpoints in the directory sorted by step.
    pub fn checkpoints(&self) -> Result<Vec<(u64, PathBuf)>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(step) = parse_step(&path) {
                found.push((step, path));
            }
        }

        found.sort_by_key(|(step, _)| *step);
        Ok(found)
    }

    fn prune(&self) -> Result<()> {
        let checkpoints = self.checkpoints()?;
        let stale = checkpoints.len().saturating_sub(self.keep);

        for (step, path) in &checkpoints[..stale] {
            debug!(step = *step; "removing stale checkpoint");
            fs::remove_file(path)?;
        }

        Ok(())
    }
}

fn parse_step(path: &Path) -> Option<u64> {
    if path.extension()? != EXTENSION {
        return None;
    }

    path.file_stem()?
        .to_str()?
        .strip_prefix(PREFIX)?
        .parse()
        .ok()
}

impl Checkpointer for JsonCheckpointer {
    fn save(&mut self, step: u64, snapshot: &Snapshot) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let path = self.dir.join(format!("{PREFIX}{step}.{EXTENSION}"));
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(snapshot)?)?;
        fs::rename(&tmp, &path)?;

        info!(step = step, path:? = path; "saved checkpoint");
        self.prune()?;
        Ok(path)
    }

    fn restore_latest(&self) -> Result<Option<Snapshot>> {
        let Some((step, path)) = self.checkpoints()?.pop() else {
            return Ok(None);
        };

        let snapshot = serde_json::from_slice(&fs::read(&path)?)?;
        info!(step = step, path:? = path; "restoring checkpoint");
        Ok(Some(snapshot))
    }
}
