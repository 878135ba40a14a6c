// Each integration test file is compiled as its own binary crate with its
// own copy of this module, so helpers used by one test binary but not
// another trigger false "dead code" warnings. Allow dead_code to silence
// them.
#![allow(dead_code)]

pub mod server;

use std::path::PathBuf;
use std::process::{Command, Output};

/// Result of running the fastcall binary.
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunResult {
    fn from_output(output: Output) -> Self {
        RunResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        }
    }
}

/// Path to the compiled fastcall binary (set by Cargo for [[bin]] targets).
pub fn fastcall_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fastcall"))
}

/// Run the fastcall binary with the given arguments.
pub fn run(args: &[&str]) -> RunResult {
    let output = Command::new(fastcall_bin())
        .args(args)
        .output()
        .expect("failed to execute fastcall binary");
    RunResult::from_output(output)
}

// -- Assertion helpers --------------------------------------------------------

/// Assert the exit code matches.
pub fn assert_exit_code(result: &RunResult, expected: i32) {
    assert_eq!(
        result.exit_code, expected,
        "Expected exit code {expected}, got {}.\nstdout: {}\nstderr: {}",
        result.exit_code, result.stdout, result.stderr,
    );
}

/// Assert stdout contains a substring.
pub fn assert_stdout_contains(result: &RunResult, needle: &str) {
    assert!(
        result.stdout.contains(needle),
        "Expected stdout to contain {needle:?}.\nstdout: {}\nstderr: {}",
        result.stdout,
        result.stderr,
    );
}

/// Assert stderr contains a substring.
pub fn assert_stderr_contains(result: &RunResult, needle: &str) {
    assert!(
        result.stderr.contains(needle),
        "Expected stderr to contain {needle:?}.\nstdout: {}\nstderr: {}",
        result.stdout,
        result.stderr,
    );
}

/// Assert stdout exactly equals expected string.
pub fn assert_stdout_eq(result: &RunResult, expected: &str) {
    assert_eq!(
        result.stdout, expected,
        "stdout does not match expected.\nstderr: {}",
        result.stderr,
    );
}
