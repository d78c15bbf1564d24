//! E2E batch consolidation through `gw consolidate`.
//!
//! Each test runs the binary as a subprocess against a temp directory that
//! holds the config, the JSON-lines batch and the record database.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Test Harness
// ---------------------------------------------------------------------------

const CONFIG: &str = r#"
[missions.S1]
min_sensing_duration_us = 1000000

[missions.S1.expected]
IW_RAW__0S = 30000000
IW_SLC__1S = 30000000
IW_GRDH_1S = 30000000

[missions.S1.product_types]
IW = ["IW_RAW__0S", "IW_SLC__1S", "IW_GRDH_1S"]

[missions.S2]

[missions.S2.expected]
MSI_L0__DS = 30000000

[missions.S2.product_types]
MSI = ["MSI_L0__DS", "MSI_L1C_TL"]
"#;

/// Build a Command targeting the gw binary with an isolated environment.
fn gw_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("gw"));
    cmd.current_dir(dir);
    cmd.env("GAPWATCH_LOG", "error");
    cmd.env("GAPWATCH_CONFIG", dir.join("config.toml"));
    cmd.env("XDG_CONFIG_HOME", dir.join("xdg"));
    cmd.env_remove("GAPWATCH_FORMAT");
    cmd.env_remove("GAPWATCH_TIMING");
    cmd
}

fn setup() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    std::fs::write(dir.path().join("config.toml"), CONFIG).expect("write config");
    dir
}

fn event_line(
    mission: &str,
    name: &str,
    acquisition: &str,
    product_type: &str,
    mode: &str,
    start_s: u32,
    end_s: u32,
) -> String {
    format!(
        r#"{{"mission":"{mission}","product_name":"{name}","acquisition_id":"{acquisition}","product_type":"{product_type}","timeliness":"NRT","instrument_mode":"{mode}","observation":{{"start":"2024-06-01T00:00:{start_s:02}Z","end":"2024-06-01T00:00:{end_s:02}Z"}}}}"#
    )
}

fn write_batch(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.join(name);
    let mut content = String::from("# test batch\n");
    for line in lines {
        content.push_str(line);
        content.push('\n');
    }
    std::fs::write(&path, content).expect("write batch");
    path
}

fn consolidate_json(dir: &Path, events: &Path, extra: &[&str]) -> Value {
    let output = gw_cmd(dir)
        .arg("consolidate")
        .arg("--events")
        .arg(events)
        .arg("--db")
        .arg(dir.join("records.db"))
        .args(extra)
        .arg("--json")
        .output()
        .expect("consolidate should not crash");
    assert!(
        output.status.success(),
        "consolidate failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("consolidate --json should produce valid JSON")
}

fn storage_ids(report: &Value) -> Vec<String> {
    report["instructions"]
        .as_array()
        .expect("instructions array")
        .iter()
        .map(|i| i["storage_id"].as_str().expect("storage_id").to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn first_batch_creates_locals_siblings_and_aggregate() {
    let dir = setup();
    let batch = write_batch(
        dir.path(),
        "batch.jsonl",
        &[event_line("S1", "S1A_RAW_1", "DT1", "IW_RAW__0S", "IW", 0, 30)],
    );

    let report = consolidate_json(dir.path(), &batch, &[]);

    assert_eq!(report["dry_run"], false);
    assert_eq!(
        storage_ids(&report),
        vec![
            "DT1:IW_GRDH_1S:NRT",
            "DT1:IW_RAW__0S:NRT",
            "DT1:IW_SLC__1S:NRT",
            "DT1:NRT"
        ]
    );
    assert_eq!(report["applied"], 4);
    assert_eq!(report["conflicts"].as_array().map(Vec::len), Some(0));
    assert_eq!(report["stats"]["events"], 1);
    assert_eq!(report["stats"]["placeholders"], 2);

    let instructions = report["instructions"].as_array().expect("array");
    assert!(instructions.iter().all(|i| i["action"] == "create"));
    assert_eq!(instructions[1]["status"], "complete");
    assert_eq!(instructions[0]["status"], "missing");
    assert_eq!(instructions[3]["kind"], "global");
    assert!(dir.path().join("records.db").exists());
}

#[test]
fn replayed_batch_changes_nothing() {
    let dir = setup();
    let batch = write_batch(
        dir.path(),
        "batch.jsonl",
        &[
            event_line("S1", "S1A_RAW_1", "DT1", "IW_RAW__0S", "IW", 0, 15),
            event_line("S1", "S1A_SLC_1", "DT1", "IW_SLC__1S", "IW", 0, 30),
        ],
    );

    let first = consolidate_json(dir.path(), &batch, &[]);
    assert_eq!(first["applied"], 4);

    let replay = consolidate_json(dir.path(), &batch, &[]);
    assert_eq!(storage_ids(&replay), Vec::<String>::new());
    assert_eq!(replay["applied"], 0);
    assert_eq!(replay["stats"]["created"], 0);
    assert_eq!(replay["stats"]["placeholders"], 0);
}

#[test]
fn late_product_updates_existing_records() {
    let dir = setup();
    let first = write_batch(
        dir.path(),
        "first.jsonl",
        &[event_line("S1", "S1A_RAW_1", "DT1", "IW_RAW__0S", "IW", 0, 30)],
    );
    let late = write_batch(
        dir.path(),
        "late.jsonl",
        &[event_line("S1", "S1A_SLC_1", "DT1", "IW_SLC__1S", "IW", 0, 30)],
    );
    consolidate_json(dir.path(), &first, &[]);

    let report = consolidate_json(dir.path(), &late, &[]);
    assert_eq!(storage_ids(&report), vec!["DT1:IW_SLC__1S:NRT", "DT1:NRT"]);
    let instructions = report["instructions"].as_array().expect("array");
    assert!(instructions.iter().all(|i| i["action"] == "update"));
    assert!(instructions.iter().all(|i| i["expected_version"] == 1));
    assert_eq!(instructions[0]["status"], "complete");
}

#[test]
fn dry_run_does_not_create_the_database() {
    let dir = setup();
    let batch = write_batch(
        dir.path(),
        "batch.jsonl",
        &[event_line("S1", "S1A_RAW_1", "DT1", "IW_RAW__0S", "IW", 0, 30)],
    );

    let report = consolidate_json(dir.path(), &batch, &["--dry-run"]);

    assert_eq!(report["dry_run"], true);
    assert_eq!(report["applied"], 0);
    assert_eq!(storage_ids(&report).len(), 4);
    assert!(!dir.path().join("records.db").exists());
}

#[test]
fn unknown_mission_is_skipped() {
    let dir = setup();
    let batch = write_batch(
        dir.path(),
        "batch.jsonl",
        &[event_line("S9", "X_1", "DT1", "IW_RAW__0S", "IW", 0, 30)],
    );

    let report = consolidate_json(dir.path(), &batch, &[]);
    assert_eq!(report["stats"]["domain_skips"], 1);
    assert_eq!(storage_ids(&report), Vec::<String>::new());
}

#[test]
fn missing_expected_duration_fails_with_code() {
    let dir = setup();
    let batch = write_batch(
        dir.path(),
        "batch.jsonl",
        &[event_line("S2", "S2A_L0_1", "DT9", "MSI_L0__DS", "MSI", 0, 30)],
    );

    gw_cmd(dir.path())
        .arg("consolidate")
        .arg("--events")
        .arg(&batch)
        .arg("--db")
        .arg(dir.path().join("records.db"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("G1003"))
        .stderr(predicate::str::contains("hint:"));
}

#[test]
fn malformed_event_line_is_reported() {
    let dir = setup();
    let batch = write_batch(
        dir.path(),
        "batch.jsonl",
        &[
            event_line("S1", "S1A_RAW_1", "DT1", "IW_RAW__0S", "IW", 0, 30),
            r#"{"mission":"S1"}"#.to_string(),
        ],
    );

    gw_cmd(dir.path())
        .arg("consolidate")
        .arg("--events")
        .arg(&batch)
        .arg("--db")
        .arg(dir.path().join("records.db"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("line 3"));
}

#[test]
fn events_can_be_read_from_stdin() {
    let dir = setup();
    let line = event_line("S1", "S1A_RAW_1", "DT1", "IW_RAW__0S", "IW", 0, 30);

    let output = gw_cmd(dir.path())
        .args(["consolidate", "--events", "-", "--db"])
        .arg(dir.path().join("records.db"))
        .arg("--format")
        .arg("text")
        .write_stdin(format!("{line}\n"))
        .output()
        .expect("consolidate should not crash");
    assert!(
        output.status.success(),
        "consolidate failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("create\tlocal\tDT1:IW_RAW__0S:NRT\tcomplete\t100.0"));
    assert!(stdout.contains("events=1 skipped=0"));
    assert!(stdout.contains("applied=4 conflicts=0"));
}

#[test]
fn timing_report_goes_to_stderr() {
    let dir = setup();
    let batch = write_batch(
        dir.path(),
        "batch.jsonl",
        &[event_line("S1", "S1A_RAW_1", "DT1", "IW_RAW__0S", "IW", 0, 30)],
    );

    let output = gw_cmd(dir.path())
        .arg("--timing")
        .arg("consolidate")
        .arg("--events")
        .arg(&batch)
        .arg("--db")
        .arg(dir.path().join("records.db"))
        .arg("--json")
        .output()
        .expect("consolidate should not crash");
    assert!(output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("timing report"), "stderr: {stderr}");
    serde_json::from_slice::<Value>(&output.stdout).expect("stdout stays valid JSON");
}
