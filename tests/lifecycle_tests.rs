//! Tests for liveness, `ps`, `stop` and `rm`.
//!
//! Containers are simulated by records pointing at ordinary child
//! processes, so these run without privileges.

mod common;

use cask::lifecycle::{is_alive, terminate};
use cask::{BatchNotice, ContainerMeta, Engine, EngineConfig, Error, Status, Termination};
use common::FakeRegistry;
use std::fs;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const GRACE: Duration = Duration::from_millis(500);
const POLL: Duration = Duration::from_millis(20);

fn engine(temp_dir: &TempDir) -> Engine {
    let config =
        EngineConfig::with_root(temp_dir.path()).cgroup_root(temp_dir.path().join("cgroup"));
    Engine::with_source(config, Arc::new(FakeRegistry::new())).unwrap()
}

fn record(name: &str, pid: i32, command: &str, sandbox: PathBuf) -> ContainerMeta {
    ContainerMeta {
        name: name.to_string(),
        process_id: pid,
        container_id: format!("{name}-0123456789abcdef"),
        image: "docker.io/library/app:latest".to_string(),
        command: command.to_string(),
        created: chrono::Utc::now(),
        status: Status::Running,
        ports: String::new(),
        sandbox,
        overlay: None,
    }
}

fn spawn_sleep() -> Child {
    Command::new("sleep")
        .arg("30")
        .process_group(0)
        .spawn()
        .unwrap()
}

/// A shell that ignores SIGTERM. The loop keeps the shell itself as the
/// recorded process instead of letting it exec `sleep`.
fn spawn_stubborn() -> Child {
    Command::new("sh")
        .args(["-c", "trap '' TERM; while true; do sleep 1; done"])
        .process_group(0)
        .spawn()
        .unwrap()
}

/// A dead container with its sandbox directory on disk.
fn add_dead(engine: &Engine, temp_dir: &TempDir, name: &str) -> ContainerMeta {
    let sandbox = temp_dir.path().join("var/sandbox").join(name);
    fs::create_dir_all(sandbox.join("etc")).unwrap();
    let meta = record(name, 0, "sleep", sandbox);
    engine.metadata().append(&meta).unwrap();
    meta
}

fn names(engine: &Engine) -> Vec<String> {
    engine
        .metadata()
        .list()
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect()
}

// =============================================================================
// Liveness Tests
// =============================================================================

#[test]
fn test_liveness_follows_process() {
    let mut child = spawn_sleep();
    let meta = record("web", child.id() as i32, "sleep", PathBuf::new());
    assert!(is_alive(&meta));

    // Same pid, different program: a recycled pid.
    let recycled = ContainerMeta {
        command: "nginx".to_string(),
        ..meta.clone()
    };
    assert!(!is_alive(&recycled));

    child.kill().unwrap();
    child.wait().unwrap();
    assert!(!is_alive(&meta));
}

#[test]
fn test_zombie_is_not_alive() {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id() as i32;
    // Give it time to exit without reaping it.
    std::thread::sleep(Duration::from_millis(200));
    assert!(!is_alive(&record("z", pid, "true", PathBuf::new())));
    child.wait().unwrap();
}

// =============================================================================
// Listing Tests
// =============================================================================

#[test]
fn test_list_derives_exited() {
    let temp_dir = TempDir::new().unwrap();
    let engine = engine(&temp_dir);
    let mut child = spawn_sleep();

    engine
        .metadata()
        .append(&record("live", child.id() as i32, "sleep", PathBuf::new()))
        .unwrap();
    engine
        .metadata()
        .append(&record("dead", 0, "sleep", PathBuf::new()))
        .unwrap();

    let listed = engine.list_containers().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].status, Status::Running);
    assert_eq!(listed[1].status, Status::Exited);

    // Derived status is never written back.
    let stored = engine.metadata().find("dead").unwrap().unwrap();
    assert_eq!(stored.status, Status::Running);

    child.kill().unwrap();
    child.wait().unwrap();
}

#[test]
fn test_list_empty_store() {
    let temp_dir = TempDir::new().unwrap();
    assert!(engine(&temp_dir).list_containers().unwrap().is_empty());
}

// =============================================================================
// Stop Tests
// =============================================================================

#[tokio::test]
async fn test_terminate_graceful() {
    let mut child = spawn_sleep();
    let meta = record("web", child.id() as i32, "sleep", PathBuf::new());

    let outcome = terminate(&meta, Duration::from_secs(5), POLL).await.unwrap();
    assert_eq!(outcome, Termination::Graceful);

    let status = child.wait().unwrap();
    assert!(!status.success());
}

#[tokio::test]
async fn test_terminate_escalates_to_kill() {
    let mut child = spawn_stubborn();
    let pid = child.id() as i32;
    std::thread::sleep(Duration::from_millis(100));
    let meta = record("stubborn", pid, "sh", PathBuf::new());
    assert!(is_alive(&meta));

    let outcome = terminate(&meta, GRACE, POLL).await.unwrap();
    assert_eq!(outcome, Termination::Forced);

    let status = child.wait().unwrap();
    assert_eq!(status.signal(), Some(libc::SIGKILL));
}

#[tokio::test]
async fn test_terminate_invalid_pid() {
    let meta = record("web", 0, "sleep", PathBuf::new());
    let result = terminate(&meta, GRACE, POLL).await;
    assert!(matches!(result, Err(Error::SignalFailed { .. })));
}

#[tokio::test]
async fn test_stop_reports_each_name() {
    let temp_dir = TempDir::new().unwrap();
    let engine = engine(&temp_dir);
    let mut child = spawn_sleep();

    engine
        .metadata()
        .append(&record("live", child.id() as i32, "sleep", PathBuf::new()))
        .unwrap();
    add_dead(&engine, &temp_dir, "dead");

    let request: Vec<String> = ["live", "dead", "ghost"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let report = engine.stop_with(&request, GRACE, POLL).await.unwrap();

    assert_eq!(report.stopped, vec![("live".to_string(), Termination::Graceful)]);
    assert_eq!(report.not_running, vec!["dead".to_string()]);
    assert_eq!(report.not_found, vec!["ghost".to_string()]);
    assert!(report.failed.is_empty());

    child.wait().unwrap();
    // Stopping keeps the record for a later `rm`.
    assert_eq!(names(&engine), vec!["live", "dead"]);
}

#[tokio::test]
async fn test_stop_by_container_id() {
    let temp_dir = TempDir::new().unwrap();
    let engine = engine(&temp_dir);
    let mut child = spawn_sleep();
    let meta = record("web", child.id() as i32, "sleep", PathBuf::new());
    engine.metadata().append(&meta).unwrap();

    let report = engine
        .stop_with(&[meta.container_id.clone()], GRACE, POLL)
        .await
        .unwrap();
    assert_eq!(report.stopped.len(), 1);
    child.wait().unwrap();
}

// =============================================================================
// Remove Tests
// =============================================================================

#[test]
fn test_remove_dead_container() {
    let temp_dir = TempDir::new().unwrap();
    let engine = engine(&temp_dir);
    let meta = add_dead(&engine, &temp_dir, "old");
    let scope = engine.cgroups().scope_path(&meta.container_id);
    fs::create_dir_all(&scope).unwrap();

    let report = engine.remove(&["old".to_string()]).unwrap();

    assert_eq!(report.removed, vec!["old".to_string()]);
    assert!(report.notice.is_none());
    assert!(names(&engine).is_empty());
    assert!(!meta.sandbox.exists());
    assert!(!scope.exists());
}

#[test]
fn test_remove_running_container_is_refused() {
    let temp_dir = TempDir::new().unwrap();
    let engine = engine(&temp_dir);
    let mut child = spawn_sleep();
    let sandbox = temp_dir.path().join("var/sandbox/live");
    fs::create_dir_all(&sandbox).unwrap();
    engine
        .metadata()
        .append(&record("live", child.id() as i32, "sleep", sandbox.clone()))
        .unwrap();
    let before = fs::read(engine.metadata().path()).unwrap();

    let report = engine.remove(&["live".to_string()]).unwrap();

    assert!(report.removed.is_empty());
    assert_eq!(
        report.notice,
        Some(BatchNotice::StillRunning("live".to_string()))
    );
    assert_eq!(fs::read(engine.metadata().path()).unwrap(), before);
    assert!(sandbox.exists());

    child.kill().unwrap();
    child.wait().unwrap();
}

#[test]
fn test_remove_stops_at_first_unknown_name() {
    let temp_dir = TempDir::new().unwrap();
    let engine = engine(&temp_dir);
    add_dead(&engine, &temp_dir, "first");
    let last = add_dead(&engine, &temp_dir, "last");

    let request: Vec<String> = ["first", "ghost", "last"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let report = engine.remove(&request).unwrap();

    assert_eq!(report.removed, vec!["first".to_string()]);
    assert_eq!(
        report.notice,
        Some(BatchNotice::NoSuchContainer("ghost".to_string()))
    );
    assert_eq!(names(&engine), vec!["last"]);
    assert!(last.sandbox.exists());
}
