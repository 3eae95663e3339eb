// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Domain error types for the agent's collaborators.
//!
//! The three actors (Manager, Worker, Reporter) do not return `Result`
//! from their main loops — per the concurrency model, a fetch or beacon
//! failure terminates the owning task, which the binary treats as a
//! fatal process exit. These types describe the errors that propagate
//! up to that boundary.

use thiserror::Error;

/// Errors raised while loading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `APP_ID` or `APP_SECRET` was not set.
    #[error("missing required credentials: {0}")]
    MissingCredentials(String),

    /// The `config` crate failed to build the environment source.
    #[error("failed to load configuration: {0}")]
    LoadFailed(#[from] config::ConfigError),
}

/// Errors raised by the coordinator HTTP client.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Underlying transport failure (connection refused, DNS, TLS, ...).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The coordinator rejected our credentials.
    #[error("authentication error")]
    Unauthorized,

    /// The coordinator returned a response that did not match any
    /// expected shape (array of test jobs, or a single setup job).
    #[error("malformed response from coordinator: {0}")]
    MalformedResponse(String),

    /// The OAuth2 token endpoint did not return a usable token.
    #[error("failed to obtain access token: {0}")]
    TokenError(String),
}

/// Errors raised while preparing the working tree for a new test run.
#[derive(Debug, Error)]
pub enum VcsError {
    /// The `git` binary could not be located or failed to start.
    #[error("git is not available: {0}")]
    GitUnavailable(#[source] std::io::Error),

    /// A `git` subcommand exited non-zero.
    #[error("git {command} failed: {stderr}")]
    CommandFailed {
        /// The git subcommand that was run, e.g. "fetch" or "checkout".
        command: String,
        /// Captured stderr.
        stderr: String,
    },
}
