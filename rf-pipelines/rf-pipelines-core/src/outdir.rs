//! Output directory management for run artifacts
//!
//! The manager is an opaque sink from the core's point of view: stages
//! route output files through [`OutdirManager::add_file`], and the clobber
//! policy fixed at construction decides whether pre-existing files are
//! overwritten or rejected.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Name of the attribute document written at the end of every run.
pub const RUN_ATTRS_BASENAME: &str = "rf_pipeline_0.json";

/// Per-run output directory handle with clobber semantics.
#[derive(Debug)]
pub struct OutdirManager {
    outdir: Option<PathBuf>,
    clobber: bool,
    basenames: Mutex<HashSet<String>>,
}

impl OutdirManager {
    /// Create the manager, creating the directory if needed. With
    /// `clobber = false`, a directory already holding a previous run's
    /// attribute document is rejected.
    pub fn new(outdir: Option<&Path>, clobber: bool) -> Result<Self> {
        if let Some(dir) = outdir {
            fs::create_dir_all(dir)?;

            let marker = dir.join(RUN_ATTRS_BASENAME);
            if !clobber && marker.exists() {
                return Err(Error::Stage(format!(
                    "output file {} already exists (clobber=false)",
                    marker.display()
                )));
            }
        }

        Ok(Self {
            outdir: outdir.map(Path::to_path_buf),
            clobber,
            basenames: Mutex::new(HashSet::new()),
        })
    }

    /// The output directory, if one was specified.
    pub fn outdir(&self) -> Option<&Path> {
        self.outdir.as_deref()
    }

    /// Whether pre-existing files are overwritten.
    pub fn clobber(&self) -> bool {
        self.clobber
    }

    /// Register an output file and return its absolute path. Fails on
    /// duplicate basenames within one run, and on pre-existing files when
    /// clobbering is disabled.
    pub fn add_file(&self, basename: &str) -> Result<PathBuf> {
        let dir = self.outdir.as_ref().ok_or_else(|| {
            Error::Stage("attempted to write output file, but no outdir was specified in run()".into())
        })?;

        let mut names = self.basenames.lock().unwrap();
        if !names.insert(basename.to_string()) {
            return Err(Error::Stage(format!(
                "duplicate output file basename '{}'",
                basename
            )));
        }

        let path = dir.join(basename);
        if !self.clobber && path.exists() {
            return Err(Error::Stage(format!(
                "output file {} already exists (clobber=false)",
                path.display()
            )));
        }

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_file() {
        let dir = tempfile::tempdir().unwrap();
        let mp = OutdirManager::new(Some(dir.path()), false).unwrap();

        let path = mp.add_file("plot0.png").unwrap();
        assert_eq!(path, dir.path().join("plot0.png"));

        // duplicate basenames within a run are rejected
        assert!(mp.add_file("plot0.png").is_err());
    }

    #[test]
    fn test_no_outdir() {
        let mp = OutdirManager::new(None, false).unwrap();
        assert!(mp.add_file("plot0.png").is_err());
    }

    #[test]
    fn test_clobber_semantics() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.png"), b"x").unwrap();

        let mp = OutdirManager::new(Some(dir.path()), false).unwrap();
        assert!(mp.add_file("old.png").is_err());

        let mp = OutdirManager::new(Some(dir.path()), true).unwrap();
        assert!(mp.add_file("old.png").is_ok());
    }

    #[test]
    fn test_nonclobber_rejects_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(RUN_ATTRS_BASENAME), b"{}").unwrap();

        assert!(OutdirManager::new(Some(dir.path()), false).is_err());
        assert!(OutdirManager::new(Some(dir.path()), true).is_ok());
    }
}
