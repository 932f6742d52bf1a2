//! Tests for the tracejit binary

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

const LOOP: &str = "descr loop = target()
[i0, i1]
i2 = int_mul(i1, 3)
i3 = int_add(i0, i2)
i4 = int_lt(i3, 1000)
guard_true(i4) [i3]
jump(i3, i1, descr=loop)
";

fn tracejit(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tracejit"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn write(dir: &TempDir, name: &str, text: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, text).unwrap();
    path
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_optimize_prints_preamble_and_loop() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "loop.trace", LOOP);
    let output = tracejit(&["optimize", file.to_str().unwrap()]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("# preamble"), "{}", text);
    assert!(text.contains("# loop"), "{}", text);
    assert!(text.contains("label("), "{}", text);
    assert!(text.contains("# short preamble"), "{}", text);
}

#[test]
fn test_optimize_json_report() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "loop.trace", LOOP);
    let output = tracejit(&["optimize", "--passes", "intbounds:pure", "--json", file.to_str().unwrap()]);
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["kind"], "loop");
    assert_eq!(report["passes"], "intbounds:pure");
    assert!(report["preamble"].is_null());
    assert_eq!(report["guards"].as_array().unwrap().len(), 1);
}

#[test]
fn test_bridge_into_loop() {
    let dir = TempDir::new().unwrap();
    let looped = write(&dir, "loop.trace", LOOP);
    let bridge = write(&dir, "bridge.trace", "[i0]\ni1 = int_add(i0, 1)\njump(i1, 7, descr=loop)\n");
    let output = tracejit(&[
        "optimize",
        "--bridge",
        "--into",
        looped.to_str().unwrap(),
        bridge.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("jump(i1, 7, 21"), "{}", stdout(&output));
}

#[test]
fn test_check_reports_mismatch() {
    let dir = TempDir::new().unwrap();
    let a = write(&dir, "a.trace", "[i0]\ni1 = int_add(i0, 1)\njump(i1)\n");
    let b = write(&dir, "b.trace", "[i5]\ni6 = int_add(i5, 1)\njump(i6)\n");
    let c = write(&dir, "c.trace", "[i0]\ni1 = int_sub(i0, 1)\njump(i1)\n");

    let same = tracejit(&["check", a.to_str().unwrap(), b.to_str().unwrap()]);
    assert!(same.status.success());
    assert!(stdout(&same).contains("equivalent"));

    let differ = tracejit(&["check", a.to_str().unwrap(), c.to_str().unwrap()]);
    assert!(!differ.status.success());
    assert!(stdout(&differ).contains("not equivalent"));
}

#[test]
fn test_run_with_inputs() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "loop.trace", LOOP);
    // the counter climbs by 6 per iteration and passes 1000 after 167 jumps
    let output = tracejit(&["run", file.to_str().unwrap(), "--inputs", "0,2", "-n", "500", "--optimize"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("GuardFailed"), "{}", stdout(&output));
}

#[test]
fn test_run_stops_at_iteration_budget() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "loop.trace", LOOP);
    let output = tracejit(&["run", file.to_str().unwrap(), "--inputs", "0,2"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("Jumped([Int(606), Int(2)])"), "{}", stdout(&output));
}

#[test]
fn test_run_rejects_wrong_arity() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "loop.trace", LOOP);
    let output = tracejit(&["run", file.to_str().unwrap(), "--inputs", "1"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("trace takes 2 inputs"));
}

#[test]
fn test_parse_error_names_the_file() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "bad.trace", "[i0]\ni1 = no_such_op(i0)\njump(i1)\n");
    let output = tracejit(&["optimize", file.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("bad.trace"));
}

#[test]
fn test_passes_lists_chain() {
    let output = tracejit(&["passes", "--passes", "intbounds:heap"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("Loop chain: intbounds -> heap -> simplify"), "{}", text);
}
