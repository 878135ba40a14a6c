mod common;

use std::sync::LazyLock;

use common::server::TestServer;
use common::{assert_exit_code, assert_stdout_contains, assert_stdout_eq, run};

static SERVER: LazyLock<TestServer> = LazyLock::new(TestServer::start);

#[test]
#[ignore]
fn echo_round_trips_values() {
    let r = run(&[&SERVER.addr, "echo", r#"["hello", 2, {"k": true}]"#]);
    assert_exit_code(&r, 0);
    assert_stdout_eq(&r, "\"hello\"\n2\n{\"k\":true}\n");
}

#[test]
#[ignore]
fn echo_with_no_args_emits_nothing() {
    let r = run(&[&SERVER.addr, "echo"]);
    assert_exit_code(&r, 0);
    assert_stdout_eq(&r, "");
}

#[test]
#[ignore]
fn yes_repeats_a_value() {
    let r = run(&[&SERVER.addr, "yes", r#"[{"value": "y", "count": 3}]"#]);
    assert_exit_code(&r, 0);
    assert_stdout_eq(&r, "\"y\"\n\"y\"\n\"y\"\n");
}

#[test]
#[ignore]
fn date_reports_a_timestamp() {
    let r = run(&[&SERVER.addr, "date"]);
    assert_exit_code(&r, 0);
    assert_stdout_contains(&r, "timestamp");
}

#[test]
#[ignore]
fn sleep_returns_its_final_value() {
    let r = run(&[&SERVER.addr, "sleep", r#"[{"ms": 10}]"#]);
    assert_exit_code(&r, 0);
    assert_stdout_contains(&r, "slept_ms");
}

#[test]
#[ignore]
fn abort_after_stops_the_stream_cleanly() {
    let r = run(&[
        "--abort-after",
        "2",
        &SERVER.addr,
        "yes",
        r#"[{"value": "v", "count": 10000}]"#,
    ]);
    assert_exit_code(&r, 0);
    assert!(
        r.stdout.lines().count() >= 2,
        "expected at least two values before the abort, got: {}",
        r.stdout
    );
}

#[test]
#[ignore]
fn snapshot_flag_prints_introspection() {
    let r = run(&["--snapshot", &SERVER.addr, "date"]);
    assert_exit_code(&r, 0);
    assert!(
        r.stderr.contains("client_id") && r.stderr.contains("recent"),
        "expected a snapshot on stderr, got: {}",
        r.stderr
    );
}
