//! End-to-end tests of the affinity-audit binary against the JSON fixtures.

use affinity_audit_types::encoding::{base64_decode, read_unit_file};
use affinity_audit_types::decode_unit;
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

fn fixture(path: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(path)
}

fn cli() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("affinity-audit").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("AFFINITY_OWNER_MARKER")
        .env_remove("AFFINITY_POLICY")
        .env_remove("AFFINITY_TARGETS")
        .env_remove("AFFINITY_FINDINGS_LOG");
    cmd
}

fn json_stdout(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

// =============================================================================
// Unit Commands
// =============================================================================

#[test]
fn test_verify_fixture_units() {
    cli()
        .arg("verify")
        .arg(fixture("units/Model.json"))
        .arg(fixture("units/Account.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("com/model/Model.setValue(I)V"))
        .stdout(predicate::str::contains("com/model/Account.deposit(I)V"));
}

#[test]
fn test_verify_listing() {
    cli()
        .arg("verify")
        .arg("--listing")
        .arg(fixture("units/Model.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("getTotal()I (max_stack 1, max_locals 0)"))
        .stdout(predicate::str::contains("GetStatic"));
}

#[test]
fn test_verify_rejects_missing_file() {
    cli()
        .arg("verify")
        .arg(fixture("units/Missing.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Missing.json"));
}

#[test]
fn test_rewrite_writes_verifiable_unit() {
    let temp_dir = TempDir::new().unwrap();
    let out = temp_dir.path().join("out/Model.bcs");

    let summary = json_stdout(
        cli()
            .arg("--json")
            .arg("rewrite")
            .arg(fixture("units/Model.json"))
            .arg("--out")
            .arg(&out),
    );
    assert_eq!(summary["type_name"], "com/model/Model");
    assert_eq!(summary["rewritten"], true);
    assert_eq!(summary["sites_instrumented"], 4);
    assert!(out.exists());

    cli().arg("verify").arg(&out).assert().success();
    let rewritten = read_unit_file(&out).unwrap();
    let original = read_unit_file(&fixture("units/Model.json")).unwrap();
    assert!(rewritten.instruction_count() > original.instruction_count());
}

#[test]
fn test_rewrite_of_rewritten_output_is_unchanged() {
    let temp_dir = TempDir::new().unwrap();
    let out = temp_dir.path().join("Model.json");
    cli()
        .arg("rewrite")
        .arg(fixture("units/Model.json"))
        .arg("--out")
        .arg(&out)
        .assert()
        .success();

    let again = json_stdout(cli().arg("--json").arg("rewrite").arg(&out));
    assert_eq!(again["rewritten"], false);
    assert_eq!(again["reason"], "already instrumented");
    assert_eq!(again["sites_instrumented"], 0);
}

#[test]
fn test_rewrite_needs_supertypes_on_classpath() {
    let without = json_stdout(
        cli()
            .arg("--json")
            .arg("rewrite")
            .arg(fixture("units/Account.json")),
    );
    assert_eq!(without["rewritten"], false);
    assert!(without["reason"]
        .as_str()
        .unwrap()
        .contains("resolution failure"));

    let with = json_stdout(
        cli()
            .arg("--json")
            .arg("rewrite")
            .arg(fixture("units/Account.json"))
            .arg("--classpath")
            .arg(fixture("units")),
    );
    assert_eq!(with["rewritten"], true);
    assert_eq!(with["sites_instrumented"], 4);

    let raw = base64_decode(with["unit_base64"].as_str().unwrap(), "rewritten unit").unwrap();
    let unit = decode_unit(&raw).unwrap();
    assert_eq!(unit.name, "com/model/Account");
}

#[test]
fn test_rewrite_respects_targets() {
    cli()
        .arg("rewrite")
        .arg(fixture("units/Model.json"))
        .arg("--targets")
        .arg("com.other")
        .assert()
        .success()
        .stdout(predicate::str::contains("unchanged (outside the instrumentation scope)"));
}

#[test]
fn test_inspect_shows_plan() {
    let plan = json_stdout(
        cli()
            .arg("--json")
            .arg("inspect")
            .arg(fixture("units/Account.json"))
            .arg("--classpath")
            .arg(fixture("units")),
    );
    assert_eq!(plan["type_name"], "com/model/Account");
    assert_eq!(plan["sites"].as_array().unwrap().len(), 4);
    let skipped = plan["skipped"].as_array().unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0]["field"], "id");
    assert_eq!(skipped[0]["reason"], "FieldExcluded");
    // The inherited field is attributed to its declaring type.
    assert!(plan["sites"]
        .as_array()
        .unwrap()
        .iter()
        .any(|s| s["owner"] == "com/model/Model" && s["field"] == "value"));

    cli()
        .arg("inspect")
        .arg(fixture("units/Account.json"))
        .arg("--classpath")
        .arg(fixture("units"))
        .assert()
        .success()
        .stdout(predicate::str::contains("owner-read-allowed"))
        .stdout(predicate::str::contains("Skipped sites: 1"));
}

#[test]
fn test_convert_between_formats() {
    let temp_dir = TempDir::new().unwrap();
    let bcs = temp_dir.path().join("Model.bcs");
    let json = temp_dir.path().join("Model.json");

    cli()
        .arg("convert")
        .arg(fixture("units/Model.json"))
        .arg(&bcs)
        .assert()
        .success();
    cli().arg("convert").arg(&bcs).arg(&json).assert().success();

    let original = read_unit_file(&fixture("units/Model.json")).unwrap();
    assert_eq!(read_unit_file(&json).unwrap(), original);
}

// =============================================================================
// Scenarios and Reports
// =============================================================================

#[test]
fn test_replay_reports_finding() {
    let report = json_stdout(
        cli()
            .arg("--json")
            .arg("replay")
            .arg(fixture("scenarios/instance.json")),
    );
    let findings = report["findings"].as_array().unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0]["writer"], "main");
    assert_eq!(findings[0]["reader"], "RSM-Thread-1");
    assert_eq!(report["bindings"]["seen"], "5");
    assert_eq!(report["loader"]["units_rewritten"], 1);
}

#[test]
fn test_replay_fail_on_findings() {
    cli()
        .arg("replay")
        .arg(fixture("scenarios/instance.json"))
        .arg("--fail-on-findings")
        .assert()
        .failure()
        .stdout(predicate::str::contains("Invalid read"))
        .stderr(predicate::str::contains("produced 1 finding(s)"));

    cli()
        .arg("replay")
        .arg(fixture("scenarios/clean.json"))
        .arg("--fail-on-findings")
        .assert()
        .success()
        .stdout(predicate::str::contains("no findings"));
}

#[test]
fn test_replay_strict_expected_failure() {
    let report = json_stdout(
        cli()
            .arg("--json")
            .arg("replay")
            .arg(fixture("scenarios/strict.json")),
    );
    assert_eq!(report["policy"], "strict_alternation");
    let failures = report["failures"].as_array().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["thread"], "Worker-1");
    assert_eq!(failures[0]["violation"], true);
    assert_eq!(failures[0]["expected"], true);
}

#[test]
fn test_findings_log_feeds_report() {
    let temp_dir = TempDir::new().unwrap();
    let log = temp_dir.path().join("findings.jsonl");

    for _ in 0..2 {
        cli()
            .arg("replay")
            .arg(fixture("scenarios/instance.json"))
            .arg("--findings-log")
            .arg(&log)
            .assert()
            .success();
    }

    let summaries = json_stdout(cli().arg("--json").arg("report").arg(&log));
    let summaries = summaries.as_array().unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["owner"], "com/model/Model");
    assert_eq!(summaries[0]["findings"], 2);
    assert_eq!(summaries[0]["write_dominance"], 2);

    cli()
        .arg("report")
        .arg(&log)
        .arg("--owner")
        .arg("com.other.Type")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 finding(s) across 0 type(s)"));
}

#[test]
fn test_json_errors_on_stderr() {
    let output = cli()
        .arg("--json")
        .arg("replay")
        .arg(fixture("scenarios/none.json"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    let err: serde_json::Value = serde_json::from_slice(&output.stderr).unwrap();
    assert!(err["error"].as_str().unwrap().contains("none.json"));
}
