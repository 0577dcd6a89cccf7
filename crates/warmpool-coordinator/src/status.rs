//! Status reports and command results handed to callers.

use serde::Serialize;
use warmpool_core::ExecutionStatus;
use warmpool_runtime::{GeneratedFiles, PoolStatus};

/// A point-in-time view of the whole coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    /// Startup permits currently held.
    pub processes_starting: usize,
    pub processes_in_use: usize,
    /// Replacement starts requested since the coordinator was created.
    pub total_started: u64,
    pub running_configurations: Vec<String>,
    pub pools: Vec<PoolStatus>,
}

impl CoordinatorStatus {
    /// Human-readable name/value pairs for the coordinator itself.
    pub fn describe(&self) -> Vec<(String, String)> {
        vec![
            (
                "Processes starting up".to_string(),
                self.processes_starting.to_string(),
            ),
            ("Processes in use".into(), self.processes_in_use.to_string()),
            (
                "Total number of processes started".into(),
                self.total_started.to_string(),
            ),
            (
                "Running configurations".into(),
                self.running_configurations.join(", "),
            ),
        ]
    }
}

/// Result of running one command through the pool.
///
/// Holds the scratch directory of the process that ran it; generated files
/// are deleted when this value is dropped.
#[derive(Debug)]
pub struct CommandResponse {
    /// The configuration that actually served the request.
    pub configuration: String,
    pub status: ExecutionStatus,
    /// Output before the completion sentinel.
    pub output: String,
    pub files: GeneratedFiles,
}

impl CommandResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Generated files relative to the output directory.
    pub fn file_names(&self) -> Vec<String> {
        self.files.entries().into_iter().map(|(name, _)| name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_status_serializes() {
        let status = CoordinatorStatus {
            processes_starting: 1,
            processes_in_use: 2,
            total_started: 7,
            running_configurations: vec!["v1".into(), "v2".into()],
            pools: Vec::new(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["processes_in_use"], 2);
        assert_eq!(json["running_configurations"][1], "v2");

        let described = status.describe();
        assert_eq!(described[2].1, "7");
        assert_eq!(described[3].1, "v1, v2");
    }

    #[test]
    fn empty_response_has_no_files() {
        let response = CommandResponse {
            configuration: "v1".into(),
            status: ExecutionStatus::TimedOut,
            output: String::new(),
            files: GeneratedFiles::default(),
        };
        assert!(!response.is_success());
        assert!(response.file_names().is_empty());
    }
}
