// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use testagent_core::config::AgentConfig;
use testagent_core::coordinator::CoordinatorClient;
use testagent_core::manager::{self, ManagerChannels};
use testagent_core::reporter::{self, ReporterChannels};
use testagent_core::vcs::GitProjectEnvironment;
use testagent_core::worker::{self, WorkerChannels};

const LOGO: &str = r"
  _            _                           _
 | |_ ___  ___| |_ __ _  __ _  ___ _ __ | |_
 | __/ _ \/ __| __/ _` |/ _` |/ _ \ '_ \| __|
 | ||  __/\__ \ || (_| | (_| |  __/ | | | |_
  \__\___||___/\__\__,_|\__, |\___|_| |_|\__|
                        |___/
";

/// Pulls test jobs from a coordinator, runs them one at a time, and
/// reports results back.
#[derive(Parser)]
#[command(name = "testagent")]
#[command(version)]
#[command(about = "Distributed test-execution agent")]
struct Cli;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    Cli::parse();

    if let Err(err) = run().await {
        eprintln!("{err}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = AgentConfig::from_env()?;

    let coordinator = Arc::new(CoordinatorClient::new(
        config.testributor_url.clone(),
        config.app_id.clone(),
        config.app_secret.clone(),
    ));
    let worker_uuid_short = coordinator.worker_uuid_short();

    let span = tracing::info_span!("agent", worker_uuid = %worker_uuid_short);
    let _guard = span.enter();

    info!("{LOGO}");
    info!(worker_uuid = %coordinator.worker_uuid(), "starting");

    let environment = GitProjectEnvironment::new(config.project_directory());
    let runner = testagent_core::process::ShellCommandRunner;

    let (jobs_tx, jobs_rx) = mpsc::channel(1);
    let (worker_idling_tx, worker_idling_rx) = mpsc::channel(1);
    let (reports_tx, reports_rx) = mpsc::channel(1);
    let (cancelled_tx, cancelled_rx) = mpsc::channel(1);

    let manager_handle = tokio::spawn(manager::run(
        coordinator.clone(),
        ManagerChannels {
            jobs_tx,
            worker_idling_rx,
            cancelled_test_run_ids_rx: cancelled_rx,
        },
    ));

    let worker_handle = tokio::spawn(worker::run(
        environment,
        runner,
        WorkerChannels { jobs_rx, worker_idling_tx, reports_tx },
    ));

    let reporter_handle = tokio::spawn(reporter::run(
        coordinator,
        ReporterChannels { reports_rx, cancelled_test_run_ids_tx: cancelled_tx },
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, exiting without draining in-flight work");
        }
        result = manager_handle => {
            if let Err(err) = result {
                anyhow::bail!("manager task failed: {err}");
            }
        }
        result = worker_handle => {
            if let Err(err) = result {
                anyhow::bail!("worker task failed: {err}");
            }
        }
        result = reporter_handle => {
            if let Err(err) = result {
                anyhow::bail!("reporter task failed: {err}");
            }
        }
    }

    Ok(())
}
