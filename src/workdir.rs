//! Temporary change of the process working directory

use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Working directory change that is undone on drop
#[derive(Debug)]
pub struct WorkdirGuard {
    /// Working directory before the change
    original: PathBuf,

    /// Truth that a return to the original working directory was attempted
    restored: bool,
}
//
impl WorkdirGuard {
    /// Remember the current working directory, then move to `root`
    pub fn enter(root: &Path) -> Result<Self, WorkdirError> {
        let original = std::env::current_dir().map_err(WorkdirError::Save)?;
        std::env::set_current_dir(root).map_err(|source| WorkdirError::Enter {
            path: root.to_owned(),
            source,
        })?;
        log::debug!(
            "Moved from {} to workload root {}",
            original.display(),
            root.display()
        );
        Ok(Self {
            original,
            restored: false,
        })
    }

    /// Working directory before the change
    pub fn original(&self) -> &Path {
        &self.original
    }

    /// Go back to the original working directory
    ///
    /// Only the first call has an effect, including when it fails. Dropping
    /// the guard calls this method.
    pub fn restore(&mut self) -> Result<(), WorkdirError> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        std::env::set_current_dir(&self.original).map_err(|source| WorkdirError::Restore {
            path: self.original.clone(),
            source,
        })?;
        log::debug!("Returned to {}", self.original.display());
        Ok(())
    }
}
//
impl Drop for WorkdirGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            log::error!("{e}");
        }
    }
}

/// Failure to change the working directory
#[derive(Debug, Error)]
pub enum WorkdirError {
    /// Could not query the current working directory
    #[error("failed to query the current working directory ({0})")]
    Save(#[source] io::Error),

    /// Could not move to the workload root
    #[error("failed to enter workload root {} ({source})", path.display())]
    Enter {
        /// Workload root
        path: PathBuf,

        /// Underlying I/O error
        source: io::Error,
    },

    /// Could not move back to the original working directory
    #[error("failed to return to {} ({source})", path.display())]
    Restore {
        /// Original working directory
        path: PathBuf,

        /// Underlying I/O error
        source: io::Error,
    },
}
