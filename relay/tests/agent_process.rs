//! Launcher scenarios against real `sh` processes.
//!
//! Commands are `sh -c <script>`; with the prompt passed as an argument it
//! lands in `$0`. Scripts sleep briefly before writing state files so their
//! modification times clear the session-start marker.
#![cfg(unix)]

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use relay::core::types::{AgentExit, LaunchStrategy, RelayStop, SessionOutcome};
use relay::io::config::{PromptVia, RelayConfig};
use relay::io::launcher::AgentLauncher;
use relay::io::shutdown::CancelFlag;
use relay::relay::run_relay;
use relay::session::{SessionContext, SessionReport, run_session};
use relay::test_support::{ScriptedVerifier, TestWorkspace, fast_config};

fn sh_config(script: &str, strategy: LaunchStrategy) -> RelayConfig {
    let mut cfg = fast_config();
    cfg.agent.command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
    cfg.agent.strategy = strategy;
    cfg.agent.inject_protocol = false;
    cfg
}

fn one_session(ws: &TestWorkspace, config: &RelayConfig, cancel: CancelFlag) -> SessionReport {
    let launcher = AgentLauncher::new(config.agent.clone(), cancel);
    let ctx = SessionContext {
        ordinal: 1,
        started_at: Utc::now(),
        prompt: "Port the parser.".to_string(),
    };
    run_session(&launcher, &ws.store(), &ctx, config).expect("session")
}

const LINGERING_HANDOFF: &str = r#"
sleep 0.1
printf 'STATUS: IN_PROGRESS\n\nParser skeleton in place.\n' > "$RELAY_STATE_DIR/progress.md"
printf 'Add error recovery to the parser.\n' > "$RELAY_STATE_DIR/next_task.md"
touch "$RELAY_STATE_DIR/handoff_ready"
exec sleep 30
"#;

#[test]
fn polling_terminates_a_lingering_agent_after_handoff() {
    let ws = TestWorkspace::new().expect("workspace");
    let mut config = sh_config(LINGERING_HANDOFF, LaunchStrategy::Polling);
    config.relay.max_sessions = 1;
    let cancel = CancelFlag::new();
    let launcher = AgentLauncher::new(config.agent.clone(), cancel.clone());
    let mut outcomes = Vec::new();

    let started = Instant::now();
    let outcome = run_relay(
        &ws.options(config, "Port the parser."),
        &launcher,
        &ScriptedVerifier::new(Vec::new()),
        &cancel,
        |event| outcomes.push(event.outcome.clone()),
    )
    .expect("relay");

    assert!(started.elapsed() < Duration::from_secs(10), "agent was not terminated");
    assert_eq!(outcomes, vec![SessionOutcome::HandedOff]);
    assert_eq!(outcome.stop, RelayStop::MaxSessions { sessions: 1 });
    let archived = fs::read_to_string(ws.paths().session_archive(1).join("next_task.md"))
        .expect("archived next task");
    assert_eq!(archived, "Add error recovery to the parser.\n");
    assert!(ws.paths().session_archive(1).join("agent.log").exists());
}

#[test]
fn polling_agent_that_completes_and_exits_stops_the_relay() {
    let ws = TestWorkspace::new().expect("workspace");
    let config = sh_config(
        r#"sleep 0.1; printf 'STATUS: COMPLETE\n\nShipped.\n' > "$RELAY_STATE_DIR/progress.md""#,
        LaunchStrategy::Polling,
    );
    let cancel = CancelFlag::new();
    let launcher = AgentLauncher::new(config.agent.clone(), cancel.clone());

    let outcome = run_relay(
        &ws.options(config, "Ship it."),
        &launcher,
        &ScriptedVerifier::new(Vec::new()),
        &cancel,
        |_| {},
    )
    .expect("relay");

    assert_eq!(outcome.stop, RelayStop::Completed);
    assert_eq!(outcome.last_session, 1);
}

#[test]
fn prompt_reaches_the_agent_as_argument_or_stdin() {
    let ws = TestWorkspace::new().expect("workspace");
    let script = r#"printf '%s' "$0" > "$RELAY_STATE_DIR/seen.txt"; echo "$RELAY_SESSION" > "$RELAY_STATE_DIR/ordinal.txt""#;
    let config = sh_config(script, LaunchStrategy::Polling);
    one_session(&ws, &config, CancelFlag::new());
    let state_dir = &ws.paths().state_dir;
    assert_eq!(
        fs::read_to_string(state_dir.join("seen.txt")).expect("seen"),
        "Port the parser."
    );
    assert_eq!(fs::read_to_string(state_dir.join("ordinal.txt")).expect("ordinal"), "1\n");

    let mut config = sh_config(r#"cat > "$RELAY_STATE_DIR/stdin.txt""#, LaunchStrategy::Polling);
    config.agent.prompt_via = PromptVia::Stdin;
    one_session(&ws, &config, CancelFlag::new());
    assert_eq!(
        fs::read_to_string(state_dir.join("stdin.txt")).expect("stdin"),
        "Port the parser."
    );
}

const STREAMED_HANDOFF: &str = r#"
printf '%s\n' '{"type":"system","subtype":"init"}'
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"Reading the grammar."},{"type":"tool_use","name":"Read"}]}}'
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Edit"}]}}'
echo 'warning: plugin cache is cold'
sleep 0.1
printf 'STATUS: IN_PROGRESS\n' > "$RELAY_STATE_DIR/progress.md"
printf 'Wire the parser into the CLI.\n' > "$RELAY_STATE_DIR/next_task.md"
printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"Handoff written."}'
"#;

#[test]
fn streamed_session_counts_tools_from_the_event_stream() {
    let ws = TestWorkspace::new().expect("workspace");
    let config = sh_config(STREAMED_HANDOFF, LaunchStrategy::Streamed);

    let report = one_session(&ws, &config, CancelFlag::new());

    assert_eq!(report.outcome, SessionOutcome::HandedOff);
    assert_eq!(report.exit, Some(AgentExit::ExitedCleanly));
    assert_eq!(report.tool_uses, 2);
    assert_eq!(report.last_tool.as_deref(), Some("Edit"));
    assert_eq!(report.summary.as_deref(), Some("Reading the grammar."));
    assert!(report.stream_errors.is_empty());
    let stream = fs::read_to_string(&ws.paths().stream_log).expect("stream log");
    assert_eq!(stream.lines().count(), 5);
    assert!(stream.contains(r#""name":"Edit""#));
}

#[test]
fn streamed_relay_archives_the_event_stream() {
    let ws = TestWorkspace::new().expect("workspace");
    let mut config = sh_config(STREAMED_HANDOFF, LaunchStrategy::Streamed);
    config.relay.max_sessions = 1;
    let cancel = CancelFlag::new();
    let launcher = AgentLauncher::new(config.agent.clone(), cancel.clone());

    let outcome = run_relay(
        &ws.options(config, "Port the parser."),
        &launcher,
        &ScriptedVerifier::new(Vec::new()),
        &cancel,
        |_| {},
    )
    .expect("relay");

    assert_eq!(outcome.stop, RelayStop::MaxSessions { sessions: 1 });
    let archive = ws.paths().session_archive(1);
    let stream = fs::read_to_string(archive.join("stream.jsonl")).expect("archived stream");
    assert!(stream.contains(r#""type":"result""#));
    let meta = fs::read_to_string(archive.join("meta.json")).expect("meta");
    assert!(meta.contains(r#""tool_uses": 2"#), "meta: {meta}");
    assert!(meta.contains(r#""summary": "Reading the grammar.""#), "meta: {meta}");
    assert!(!meta.contains("stream_errors"), "meta: {meta}");
}

#[test]
fn streamed_result_error_is_classified_as_rate_limited() {
    let ws = TestWorkspace::new().expect("workspace");
    let config = sh_config(
        r#"printf '%s\n' '{"type":"result","is_error":true,"result":"Claude AI usage limit reached|1700003600"}'; exit 1"#,
        LaunchStrategy::Streamed,
    );

    let report = one_session(&ws, &config, CancelFlag::new());

    match report.outcome {
        SessionOutcome::RateLimited { reason, .. } => {
            assert!(reason.contains("usage limit reached"), "reason: {reason}");
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
}

#[test]
fn streamed_error_results_are_reported() {
    let ws = TestWorkspace::new().expect("workspace");
    let config = sh_config(
        r#"printf '%s\n' '{"type":"result","subtype":"error","is_error":true,"result":"tool runner crashed"}'; exit 1"#,
        LaunchStrategy::Streamed,
    );

    let report = one_session(&ws, &config, CancelFlag::new());

    assert!(matches!(report.outcome, SessionOutcome::Crashed { .. }));
    assert_eq!(report.stream_errors, vec!["tool runner crashed".to_string()]);
}

#[test]
fn throttling_message_on_stderr_is_detected() {
    let ws = TestWorkspace::new().expect("workspace");
    let config = sh_config(
        r#"echo 'Error: 429 Too Many Requests' >&2; exit 1"#,
        LaunchStrategy::Polling,
    );

    let report = one_session(&ws, &config, CancelFlag::new());

    assert!(
        matches!(report.outcome, SessionOutcome::RateLimited { .. }),
        "outcome: {:?}",
        report.outcome
    );
}

#[test]
fn hard_timeout_kills_the_agent_and_counts_as_crash() {
    let ws = TestWorkspace::new().expect("workspace");
    let mut config = sh_config("exec sleep 30", LaunchStrategy::Polling);
    config.agent.session_timeout_secs = 1;

    let started = Instant::now();
    let report = one_session(&ws, &config, CancelFlag::new());

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(report.timed_out);
    match report.outcome {
        SessionOutcome::Crashed { reason } => assert!(reason.contains("after timeout"), "reason: {reason}"),
        other => panic!("expected crash, got {other:?}"),
    }
}

#[test]
fn unread_stdin_prompt_cannot_outlast_the_session_timeout() {
    let ws = TestWorkspace::new().expect("workspace");
    let mut config = sh_config("exec sleep 30", LaunchStrategy::Polling);
    config.agent.prompt_via = PromptVia::Stdin;
    config.agent.session_timeout_secs = 1;
    let launcher = AgentLauncher::new(config.agent.clone(), CancelFlag::new());
    let ctx = SessionContext {
        ordinal: 1,
        started_at: Utc::now(),
        prompt: "x".repeat(300 * 1024),
    };

    let started = Instant::now();
    let report = run_session(&launcher, &ws.store(), &ctx, &config).expect("session");

    assert!(started.elapsed() < Duration::from_secs(10), "took {:?}", started.elapsed());
    assert!(report.timed_out);
    assert!(matches!(report.outcome, SessionOutcome::Crashed { .. }));
}

#[test]
fn cancel_flag_interrupts_a_running_agent() {
    let ws = TestWorkspace::new().expect("workspace");
    let config = sh_config("exec sleep 30", LaunchStrategy::Polling);
    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    let raiser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        trigger.cancel();
    });

    let started = Instant::now();
    let report = one_session(&ws, &config, cancel);
    raiser.join().expect("join");

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.outcome, SessionOutcome::Interrupted);
}

#[test]
fn silent_exit_without_activity_is_a_crash() {
    let ws = TestWorkspace::new().expect("workspace");
    let config = sh_config("echo 'segfault in renderer' >&2; exit 3", LaunchStrategy::Polling);

    let report = one_session(&ws, &config, CancelFlag::new());

    assert_eq!(report.exit, Some(AgentExit::Crashed { code: Some(3) }));
    match report.outcome {
        SessionOutcome::Crashed { reason } => {
            assert!(reason.starts_with("agent exited with code 3"), "reason: {reason}");
        }
        other => panic!("expected crash, got {other:?}"),
    }
    let log = fs::read_to_string(&ws.paths().agent_log).expect("agent log");
    assert!(log.contains("segfault in renderer"));
}

#[test]
fn missing_agent_binary_is_a_launch_crash() {
    let ws = TestWorkspace::new().expect("workspace");
    let mut config = fast_config();
    config.agent.command = vec!["relay-test-no-such-agent".to_string()];

    let report = one_session(&ws, &config, CancelFlag::new());

    match report.outcome {
        SessionOutcome::Crashed { reason } => assert!(reason.starts_with("launch failed"), "reason: {reason}"),
        other => panic!("expected crash, got {other:?}"),
    }
    assert_eq!(report.exit, None);
}
