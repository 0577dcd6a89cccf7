//! The `warmpoold healthcheck` command: start one process and time a trivial command.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use warmpool_coordinator::{PoolCoordinator, best_match};
use warmpool_core::{ExecutionStatus, WarmpoolConfig};
use warmpool_runtime::OsSpawner;

const HEALTHCHECK_COMMAND: &str = "1+1;";

#[derive(Debug)]
pub struct HealthReport {
    pub configuration: String,
    pub pid: Option<u32>,
    pub startup: Duration,
    pub execution: Duration,
    pub status: ExecutionStatus,
    pub output: String,
}

impl HealthReport {
    fn print(&self) {
        println!("Configuration:  {}", self.configuration);
        if let Some(pid) = self.pid {
            println!("Process id:     {pid}");
        }
        println!("Startup time:   {} ms", self.startup.as_millis());
        println!("Command:        {HEALTHCHECK_COMMAND}");
        println!("Status:         {:?}", self.status);
        println!("Execution time: {} ms", self.execution.as_millis());
        println!("Output:");
        println!("{}", self.output);
    }
}

pub async fn run(config_path: &Path, requested: Option<&str>) -> anyhow::Result<()> {
    let settings = WarmpoolConfig::from_file(config_path)?.resolve()?;
    let coordinator = PoolCoordinator::new(settings, Arc::new(OsSpawner));

    let result = check(&coordinator, requested).await;
    coordinator.destroy().await;
    let report = result?;
    report.print();

    if !report.status.is_success() {
        anyhow::bail!("{HEALTHCHECK_COMMAND} did not complete");
    }
    Ok(())
}

/// Start a process for the best match of `requested` outside any warm pool
/// and run the health check command on it.
pub async fn check(
    coordinator: &PoolCoordinator,
    requested: Option<&str>,
) -> anyhow::Result<HealthReport> {
    let names: Vec<String> = coordinator
        .available_configurations()
        .await
        .into_keys()
        .collect();
    let name = best_match(&names, requested)
        .map(str::to_string)
        .context("no configurations available")?;
    let config = coordinator
        .process_configuration(&name)
        .await
        .with_context(|| format!("configuration {name} vanished"))?;

    coordinator.start_configuration(&name).await?;

    let started = Instant::now();
    let mut process = coordinator.make_process(&name).await?;
    let startup = started.elapsed();

    process.activate();
    let started = Instant::now();
    let status = process
        .execute(HEALTHCHECK_COMMAND, config.execution_timeout(), "")
        .await;
    let execution = started.elapsed();
    let output = process.output();
    let pid = process.pid();
    process.kill().await;

    Ok(HealthReport {
        configuration: name,
        pid,
        startup,
        execution,
        status,
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use warmpool_core::{PoolConfiguration, ProcessConfiguration};
    use warmpool_runtime::testing::{FakeBehaviour, FakeSpawner};

    fn coordinator(behaviour: FakeBehaviour, names: &[&str]) -> PoolCoordinator {
        let configurations: BTreeMap<_, _> = names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    ProcessConfiguration {
                        startup_timeout_ms: 500,
                        execution_timeout_ms: 500,
                        ..Default::default()
                    },
                )
            })
            .collect();
        let settings = PoolConfiguration {
            configurations,
            ..Default::default()
        };
        PoolCoordinator::new(settings, Arc::new(FakeSpawner::new(behaviour)))
    }

    #[tokio::test]
    async fn healthy_interpreter_reports_output() {
        let coordinator = coordinator(FakeBehaviour::Interpreter, &["5.41.0", "5.47.0"]);
        let report = check(&coordinator, Some("5.45.0")).await.unwrap();
        assert_eq!(report.configuration, "5.41.0");
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert!(report.output.contains("(%o1) 2"), "output was {:?}", report.output);
        coordinator.destroy().await;
    }

    #[tokio::test]
    async fn hanging_interpreter_times_out() {
        let coordinator = coordinator(FakeBehaviour::Hangs, &["5.47.0"]);
        let report = check(&coordinator, None).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::TimedOut);
        coordinator.destroy().await;
    }

    #[tokio::test]
    async fn no_configurations_is_an_error() {
        let coordinator = coordinator(FakeBehaviour::Interpreter, &[]);
        assert!(check(&coordinator, None).await.is_err());
    }

    #[tokio::test]
    async fn startup_failure_is_reported() {
        let coordinator = coordinator(FakeBehaviour::ExitsImmediately, &["5.47.0"]);
        assert!(check(&coordinator, None).await.is_err());
        coordinator.destroy().await;
    }
}
