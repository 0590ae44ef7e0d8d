use std::fs;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};

const BIN: &str = env!("CARGO_BIN_EXE_cyclesim");

fn spawn(args: &[String]) -> Child {
    Command::new(BIN)
        .args(args)
        .env("RUST_LOG", "debug")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap()
}

fn summary_of(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

fn assert_success(out: &Output) {
    assert!(
        out.status.success(),
        "exit {:?}\n{}",
        out.status,
        String::from_utf8_lossy(&out.stderr)
    );
}

#[test]
fn test_three_processes_in_lockstep() {
    let dir = tempfile::Builder::new()
        .prefix("cyclesim_test")
        .tempdir()
        .unwrap();
    let uri = dir.path().join("barrier").to_str().unwrap().to_string();
    let args = |leader: bool, idx: usize| {
        vec![
            format!("+barrier_uri={}", uri),
            format!("+barrier_leader={}", leader as u8),
            "+barrier_procs=3".to_string(),
            "+barrier_timeout_ms=20000".to_string(),
            "+max_cycles=200".to_string(),
            "+open_retries=100".to_string(),
            // simulator plusargs the driver does not know
            "+trace".to_string(),
            format!(
                "--summary={}",
                dir.path().join(format!("p{}.json", idx)).display()
            ),
        ]
    };

    // followers come up first and retry until the leader has published
    let f1 = spawn(&args(false, 1));
    let f2 = spawn(&args(false, 2));
    let leader = spawn(&args(true, 0));

    for child in [leader, f1, f2] {
        assert_success(&child.wait_with_output().unwrap());
    }
    for idx in 0..3 {
        let v = summary_of(&dir.path().join(format!("p{}.json", idx)));
        assert_eq!(v["run"]["cycles"], 200);
        assert_eq!(v["run"]["stop_reason"], "max_cycles");
        assert_eq!(v["run"]["barrier_leader"], idx == 0);
        assert_eq!(v["cli"]["barrier_procs"], 3);
    }
    assert!(!Path::new(&uri).exists());
}

#[test]
fn test_unsynchronized_run() {
    let dir = tempfile::Builder::new()
        .prefix("cyclesim_test")
        .tempdir()
        .unwrap();
    let summary = dir.path().join("solo.json");
    let out = spawn(&[
        "--max-cycles=1000".to_string(),
        "--period=2e-9".to_string(),
        format!("--summary={}", summary.display()),
    ])
    .wait_with_output()
    .unwrap();
    assert_success(&out);
    let v = summary_of(&summary);
    assert_eq!(v["run"]["cycles"], 1000);
    assert_eq!(v["run"]["sim_time"], 2_000_000);
    assert!(v["run"]["barrier_uri"].is_null());
}

#[test]
fn test_missing_peer_exits_nonzero() {
    let dir = tempfile::Builder::new()
        .prefix("cyclesim_test")
        .tempdir()
        .unwrap();
    let uri = dir.path().join("lonely").to_str().unwrap().to_string();
    let out = spawn(&[
        format!("+barrier_uri={}", uri),
        "+barrier_leader=1".to_string(),
        "+barrier_procs=2".to_string(),
        "+barrier_timeout_ms=100".to_string(),
    ])
    .wait_with_output()
    .unwrap();
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains(&uri), "{}", stderr);
    assert!(stderr.contains("cycle 1"), "{}", stderr);
    assert!(!Path::new(&uri).exists());
}

#[test]
fn test_invalid_config_exits_nonzero() {
    let out = spawn(&[
        "+barrier_uri=/tmp/cyclesim_never_created".to_string(),
        "+barrier_procs=0".to_string(),
    ])
    .wait_with_output()
    .unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("invalid configuration"));
}
