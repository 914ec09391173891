//! Discoverability file.
//!
//! While the server listens, a small JSON file records the process and port
//! so a test driver can find it without guessing. The file is removed when
//! the [`RunFile`] guard drops.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RunFileError {
    #[error("failed to write run file {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read run file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid run file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub pid: u32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RunFile {
    path: PathBuf,
}

impl RunFile {
    pub fn create(path: impl Into<PathBuf>, port: u16) -> Result<Self, RunFileError> {
        let path = path.into();
        let info = RunInfo {
            pid: std::process::id(),
            port,
            started_at: Utc::now(),
        };

        let write = |path: &Path| -> io::Result<()> {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let json = serde_json::to_vec_pretty(&info).map_err(io::Error::other)?;
            fs::write(path, json)
        };

        write(&path).map_err(|source| RunFileError::Write {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), port, "Run file written");

        Ok(Self { path })
    }

    pub fn read(path: &Path) -> Result<RunInfo, RunFileError> {
        let bytes = fs::read(path).map_err(|source| RunFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| RunFileError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Run file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove run file"),
        }
    }
}
