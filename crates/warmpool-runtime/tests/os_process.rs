//! Managed processes and pools over real OS processes.
//!
//! A short POSIX shell script stands in for the interpreter: it prints the
//! usual prompts, answers `1+1;`, echoes the completion sentinel when it sees
//! the `concat(...)` expression, and exits on `quit();`.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use warmpool_core::{ExecutionStatus, PoolError, ProcessConfiguration};
use warmpool_runtime::{ManagedProcess, OsSpawner, ProcessPool};

const FAKE_MAXIMA: &str = r#"
echo 'Maxima 5.47.0'
printf '(%%i1) '
while IFS= read -r line; do
  case "$line" in *"load("*) printf '(%%i2) ' ;; esac
  case "$line" in *"1+1;"*) echo '(%o1) 2' ;; esac
  case "$line" in "OUTDIR "*) echo '<svg/>' > "${line#OUTDIR }/plot.svg" ;; esac
  case "$line" in *"concat("*) echo '(%o2) --COMPLETED--kill--PROCESS--' ;; esac
  case "$line" in *"quit()"*) exit 0 ;; esac
done
"#;

fn sh_config(script: &str) -> ProcessConfiguration {
    ProcessConfiguration {
        command_line: vec!["sh".into(), "-c".into(), script.into()],
        working_directory: std::env::temp_dir(),
        startup_timeout_ms: 5000,
        ..Default::default()
    }
}

async fn wait_for_exit(process: &ManagedProcess) -> bool {
    for _ in 0..200 {
        if process.has_exited() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn executes_a_command() {
    let config = Arc::new(sh_config(FAKE_MAXIMA));
    let mut process = ManagedProcess::start(config, &OsSpawner).await.unwrap();
    assert!(process.pid().is_some());

    let status = process.execute("1+1;", Duration::from_secs(5), "").await;
    assert_eq!(status, ExecutionStatus::Completed);
    let output = process.output();
    assert!(output.contains('2'), "output was {output:?}");
    assert!(!output.contains("--COMPLETED--"));
    assert!(wait_for_exit(&process).await);
}

#[tokio::test]
async fn timed_out_command_is_killed() {
    let config = Arc::new(sh_config("echo '(%i1)'; exec sleep 30"));
    let mut process = ManagedProcess::start(config, &OsSpawner).await.unwrap();

    let started = Instant::now();
    let status = process
        .execute("while true do 1;", Duration::from_millis(50), "")
        .await;
    assert_eq!(status, ExecutionStatus::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(process.was_killed());
    assert!(wait_for_exit(&process).await);
}

#[tokio::test]
async fn extra_file_load_uses_absolute_path() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("stack.mac"), "/* empty */").unwrap();
    let config = Arc::new(ProcessConfiguration {
        working_directory: dir.path().to_path_buf(),
        extra_file_to_load: Some("stack.mac".into()),
        process_has_started_output: "(%i1)".into(),
        process_is_ready_output: "(%i2)".into(),
        ..sh_config(FAKE_MAXIMA)
    });

    let mut process = ManagedProcess::start(config, &OsSpawner).await.unwrap();
    assert!(process.raw_output().contains("(%i2)"));
    process.kill().await;
    process.kill().await;
}

#[tokio::test]
async fn missing_program_is_a_startup_failure() {
    let config = Arc::new(ProcessConfiguration {
        command_line: vec!["/nonexistent/warmpool-interpreter".into()],
        ..Default::default()
    });
    let err = ManagedProcess::start(config, &OsSpawner).await.unwrap_err();
    assert!(matches!(err, PoolError::StartupFailure(_)));
}

#[tokio::test]
async fn generated_files_are_listed_and_cleaned_up() {
    let config = Arc::new(ProcessConfiguration {
        file_handling: true,
        path_command_template: "OUTDIR %OUTPUT-DIR-NE%".into(),
        ..sh_config(FAKE_MAXIMA)
    });
    let mut process = ManagedProcess::start(config, &OsSpawner).await.unwrap();
    let status = process.execute("1+1;", Duration::from_secs(5), "").await;
    assert_eq!(status, ExecutionStatus::Completed);

    let files = process.take_generated_files();
    let entries = files.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "plot.svg");
    let path = entries[0].1.clone();
    assert!(path.exists());
    drop(files);
    assert!(!path.exists());
}

#[tokio::test]
async fn pool_serves_real_processes() {
    let pool = ProcessPool::new(
        "sh",
        Arc::new(sh_config(FAKE_MAXIMA)),
        Arc::new(OsSpawner),
        Duration::from_secs(5),
    );
    pool.start_process().await.unwrap();

    let mut process = pool.get_process().await.unwrap();
    process.activate();
    let status = process.execute("1+1;", Duration::from_secs(5), "").await;
    assert!(status.is_success());
    assert!(process.output().contains("(%o1) 2"));

    pool.destroy().await;
}
