// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Working-tree preparation. A named external collaborator: the
//! Worker asks it to bring the checkout to a given commit whenever the
//! test-run identity changes, and nothing else in the engine knows how
//! that happens.

use std::path::PathBuf;

use tokio::process::Command;
use tracing::info;

use crate::error::VcsError;

/// Brings the working tree to a given commit. Implemented behind a
/// trait so the Worker can be exercised in tests without a real git
/// checkout.
pub trait ProjectEnvironment {
    /// Prepares the working tree for `commit_sha`: fetch, checkout,
    /// hard reset, clean untracked files.
    async fn setup_test_environment(&self, commit_sha: &str) -> Result<(), VcsError>;
}

/// Shells out to the system `git` binary in `project_directory`.
pub struct GitProjectEnvironment {
    project_directory: PathBuf,
}

impl GitProjectEnvironment {
    /// Builds an environment rooted at `project_directory`.
    pub fn new(project_directory: impl Into<PathBuf>) -> Self {
        Self {
            project_directory: project_directory.into(),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<(), VcsError> {
        let output = Command::new("git")
            .current_dir(&self.project_directory)
            .args(args)
            .output()
            .await
            .map_err(VcsError::GitUnavailable)?;

        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

impl ProjectEnvironment for GitProjectEnvironment {
    async fn setup_test_environment(&self, commit_sha: &str) -> Result<(), VcsError> {
        info!(commit_sha, "preparing working tree");
        self.git(&["fetch", "--all"]).await?;
        self.git(&["checkout", commit_sha]).await?;
        self.git(&["reset", "--hard", commit_sha]).await?;
        self.git(&["clean", "-fdx"]).await?;
        Ok(())
    }
}
