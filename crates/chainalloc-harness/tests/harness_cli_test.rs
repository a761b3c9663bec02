//! Integration test: the `harness` binary end to end.

use std::process::Command;

use chainalloc_harness::structured_log::validate_log_line;

fn harness() -> Command {
    Command::new(env!("CARGO_BIN_EXE_harness"))
}

fn scratch_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("chainalloc-harness-{}-{name}", std::process::id()))
}

#[test]
fn scenarios_emit_valid_jsonl() {
    let path = scratch_path("scenarios.jsonl");
    let output = harness()
        .args(["--log", "warn", "scenarios", "--lifecycle", "--run-id", "ci"])
        .arg("--output")
        .arg(&path)
        .output()
        .expect("failed to run harness scenarios");
    assert!(
        output.status.success(),
        "harness failed:\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    let content = std::fs::read_to_string(&path).expect("jsonl should be readable");
    let mut verdicts = 0;
    let mut lifecycle = 0;
    for (i, line) in content.lines().enumerate() {
        let entry = validate_log_line(line, i + 1).unwrap_or_else(|errs| {
            panic!("invalid line {}: {:?}", i + 1, errs);
        });
        assert_eq!(entry.run_id.as_deref(), Some("ci"));
        if entry.event == "scenario_result" {
            verdicts += 1;
            assert_eq!(
                entry.outcome,
                Some(chainalloc_harness::structured_log::Outcome::Pass)
            );
        } else {
            lifecycle += 1;
            assert!(entry.trace_id.starts_with("core::malloc::"));
        }
    }
    assert_eq!(verdicts, chainalloc_harness::scenarios::names().len());
    assert!(lifecycle > verdicts);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn stress_writes_passing_report() {
    let path = scratch_path("stress.json");
    let output = harness()
        .args(["--log", "warn", "stress", "--threads", "3", "--rounds", "1500"])
        .arg("--output")
        .arg(&path)
        .output()
        .expect("failed to run harness stress");
    assert!(
        output.status.success(),
        "stress failed:\nstderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    let content = std::fs::read_to_string(&path).expect("report should be readable");
    let report: serde_json::Value = serde_json::from_str(&content).expect("report should parse");
    assert_eq!(report["violations"], 0);
    assert_eq!(report["live_blocks_after"], 0);
    assert_eq!(report["workers"].as_array().map(Vec::len), Some(3));
    assert_eq!(report["config"]["backend"], "buffered");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn list_prints_every_scenario() {
    let output = harness().arg("list").output().expect("failed to run harness list");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let listed: Vec<_> = stdout.lines().collect();
    assert_eq!(listed, chainalloc_harness::scenarios::names());
}

#[test]
fn bad_seed_is_rejected() {
    let output = harness()
        .args(["stress", "--seed", "not-a-seed"])
        .output()
        .expect("failed to run harness stress");
    assert!(!output.status.success());
}
