// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Environment-variable configuration loading.

use serde::Deserialize;

use crate::coordinator::DEFAULT_COORDINATOR_URL;
use crate::error::ConfigError;

/// The agent's full configuration surface: two required credentials
/// and two optional overrides, loaded from the process environment.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// OAuth2 client-credentials client id.
    pub app_id: String,
    /// OAuth2 client-credentials client secret.
    pub app_secret: String,
    /// Coordinator base URL.
    #[serde(default = "default_testributor_url")]
    pub testributor_url: String,
    /// VCS checkout root.
    #[serde(default)]
    pub testributor_project_directory: Option<String>,
}

fn default_testributor_url() -> String {
    DEFAULT_COORDINATOR_URL.to_string()
}

impl AgentConfig {
    /// Loads configuration from the process environment, with
    /// `APP_ID`/`APP_SECRET` required and the rest defaulted. Missing
    /// credentials surface as [`ConfigError::MissingCredentials`]
    /// rather than the `config` crate's generic deserialize error, so
    /// the startup failure message is actionable.
    pub fn from_env() -> Result<Self, ConfigError> {
        for var in ["APP_ID", "APP_SECRET"] {
            if std::env::var(var).unwrap_or_default().is_empty() {
                return Err(ConfigError::MissingCredentials(var.to_string()));
            }
        }

        let source = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        source.try_deserialize().map_err(ConfigError::from)
    }

    /// The project directory to check out into, defaulting to the
    /// current working directory.
    pub fn project_directory(&self) -> std::path::PathBuf {
        self.testributor_project_directory
            .clone()
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
    }
}
