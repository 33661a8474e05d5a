//! Integration tests for the `tether` binary

use std::path::PathBuf;
use std::process::{Command, Output};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

fn tether(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tether"))
        .args(args)
        .output()
        .expect("failed to run tether")
}

fn build(dir: &tempfile::TempDir) -> PathBuf {
    let output = dir.path().join("metadata.bin");
    let result = tether(&[
        "build",
        "--input",
        fixture("decls.json").to_str().unwrap(),
        "--output",
        output.to_str().unwrap(),
    ]);
    assert!(result.status.success(), "{}", String::from_utf8_lossy(&result.stderr));
    output
}

// ============================================================================
// build
// ============================================================================

#[test]
fn test_build_writes_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let output = build(&dir);
    let store = tether_meta::MetadataStore::open(&output).unwrap();
    assert!(store.lookup("tether_identity").is_some());
    assert!(store.lookup("CGPoint").is_some());
    // variadic functions are dropped
    assert!(store.lookup("tether_printf").is_none());
}

#[test]
fn test_build_reports_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("metadata.bin");
    let result = tether(&[
        "build",
        "-i",
        fixture("decls.json").to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ]);
    let stdout = String::from_utf8_lossy(&result.stdout);
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stdout.contains("1 skipped"), "{}", stdout);
    assert!(stderr.contains("tether_printf"), "{}", stderr);
}

#[test]
fn test_build_rejects_invalid_json() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("broken.json");
    std::fs::write(&input, "{ \"modules\": [").unwrap();
    let result = tether(&["build", "--input", input.to_str().unwrap()]);
    assert!(!result.status.success());
}

// ============================================================================
// dump
// ============================================================================

#[test]
fn test_dump_lists_declarations() {
    let dir = tempfile::tempdir().unwrap();
    let output = build(&dir);
    let result = tether(&["dump", output.to_str().unwrap()]);
    assert!(result.status.success());
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.contains("Function tether_identity"), "{}", stdout);
    assert!(stdout.contains("Struct CGPoint"), "{}", stdout);
    assert!(stdout.contains("x: Double"), "{}", stdout);
    assert!(stdout.contains("copy -[copy]"), "{}", stdout);
    assert!(stdout.contains("owned"), "{}", stdout);
}

#[test]
fn test_dump_single_declaration() {
    let dir = tempfile::tempdir().unwrap();
    let output = build(&dir);
    let result = tether(&["dump", output.to_str().unwrap(), "--name", "Color"]);
    assert!(result.status.success());
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.starts_with("JsCode Color"), "{}", stdout);
    assert!(stdout.contains("\"Green\":1"), "{}", stdout);

    let missing = tether(&["dump", output.to_str().unwrap(), "--name", "Nope"]);
    assert!(!missing.status.success());
}

#[test]
fn test_dump_modules() {
    let dir = tempfile::tempdir().unwrap();
    let output = build(&dir);
    let result = tether(&["dump", output.to_str().unwrap(), "--modules"]);
    assert!(result.status.success());
    assert!(String::from_utf8_lossy(&result.stdout).contains("Fixtures"));
}
