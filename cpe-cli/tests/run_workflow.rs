//! End-to-end tests for the `cpe` binary.
//!
//! Each test writes a small corpus and descriptor into a temporary directory
//! and runs the real binary against it. The fenced test launches workers by
//! re-invoking the binary with its `worker` subcommand.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

fn cpe_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cpe"))
}

/// Writes `count` short documents under `root/corpus`.
fn write_corpus(root: &Path, count: usize) -> PathBuf {
    let corpus = root.join("corpus");
    fs::create_dir_all(&corpus).unwrap();
    for i in 0..count {
        fs::write(
            corpus.join(format!("doc{:02}.txt", i)),
            format!("Document number {} has a few words.", i),
        )
        .unwrap();
    }
    corpus
}

fn write_descriptor(root: &Path, corpus: &Path, stats_section: &str) -> PathBuf {
    let descriptor = root.join("pipeline.ini");
    fs::write(
        &descriptor,
        format!(
            "[cpe]\nname = e2e\npipelines = 2\n\n\
             [reader]\ncomponent = directory\ndirectory = {}\nextension = txt\n\n\
             [processor.tokens]\ncomponent = whitespace_tokenizer\n\n\
             {}",
            corpus.display(),
            stats_section
        ),
    )
    .unwrap();
    descriptor
}

fn run(descriptor: &Path, log_dir: &Path, extra: &[&str]) -> std::process::Output {
    Command::new(cpe_bin())
        .arg("run")
        .arg("--config")
        .arg(descriptor)
        .arg("--log-dir")
        .arg(log_dir)
        .args(extra)
        .output()
        .expect("failed to launch cpe")
}

#[test]
fn test_integrated_run_completes() {
    let temp = TempDir::new().unwrap();
    let corpus = write_corpus(temp.path(), 6);
    let descriptor = write_descriptor(
        temp.path(),
        &corpus,
        "[processor.stats]\ncomponent = token_statistics\n",
    );

    let output = run(&descriptor, &temp.path().join("logs"), &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("CPE 'e2e' Completed"), "stdout: {}", stdout);
    assert!(stdout.contains("6 read, 6 completed"), "stdout: {}", stdout);
    assert!(temp.path().join("logs").join("cpe.log").exists());
}

#[test]
fn test_entity_limit_override() {
    let temp = TempDir::new().unwrap();
    let corpus = write_corpus(temp.path(), 5);
    let descriptor = write_descriptor(temp.path(), &corpus, "");

    let output = run(&descriptor, &temp.path().join("logs"), &["--entity-limit", "2"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("2 read, 2 completed"), "stdout: {}", stdout);
}

#[test]
fn test_fenced_stage_runs_in_worker_processes() {
    let temp = TempDir::new().unwrap();
    let corpus = write_corpus(temp.path(), 4);
    let descriptor = write_descriptor(
        temp.path(),
        &corpus,
        "[processor.stats]\ncomponent = token_statistics\ndeployment = fenced\npool_size = 2\n",
    );

    let output = run(&descriptor, &temp.path().join("logs"), &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("4 read, 4 completed"), "stdout: {}", stdout);
    assert!(stdout.contains("stats [fenced"), "stdout: {}", stdout);
}

#[test]
fn test_unknown_component_fails() {
    let temp = TempDir::new().unwrap();
    let corpus = write_corpus(temp.path(), 1);
    let descriptor = write_descriptor(
        temp.path(),
        &corpus,
        "[processor.bogus]\ncomponent = no_such_component\n",
    );

    let output = run(&descriptor, &temp.path().join("logs"), &[]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no_such_component"), "stderr: {}", stderr);
}

#[test]
fn test_missing_descriptor_fails() {
    let temp = TempDir::new().unwrap();
    let output = run(&temp.path().join("absent.ini"), &temp.path().join("logs"), &[]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to load descriptor"));
}
