//! End-to-end relay scenarios driven by scripted launchers.
//!
//! Each test queues the sessions an agent would run, then checks the stop
//! reason, the persisted counters and the archives the relay leaves behind.

use std::fs;

use relay::core::knowledge;
use relay::core::types::{Phase, RelayStop, SessionOutcome};
use relay::io::shutdown::CancelFlag;
use relay::io::status::load_status;
use relay::relay::{SessionEvent, run_relay};
use relay::test_support::{ScriptedLauncher, ScriptedSession, ScriptedVerifier, TestWorkspace, fast_config};

fn no_verify() -> ScriptedVerifier {
    ScriptedVerifier::new(Vec::new())
}

/// handoff -> handoff -> complete: three sessions, then a completed stop.
#[test]
fn relay_runs_until_completion_marker() {
    let ws = TestWorkspace::new().expect("workspace");
    let launcher = ScriptedLauncher::new(vec![
        ScriptedSession::handoff("Write the lexer."),
        ScriptedSession::handoff("Write the parser on top of the lexer tokens."),
        ScriptedSession::complete("COMPLETE"),
    ]);
    let mut events: Vec<SessionEvent> = Vec::new();

    let outcome = run_relay(
        &ws.options(fast_config(), "Build a calculator."),
        &launcher,
        &no_verify(),
        &CancelFlag::new(),
        |event| events.push(event.clone()),
    )
    .expect("relay");

    assert_eq!(outcome.stop, RelayStop::Completed);
    assert_eq!(outcome.last_session, 3);
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.outcome == SessionOutcome::HandedOff));

    let store = ws.store();
    assert_eq!(store.read_session_count().expect("count"), 3);
    assert!(!ws.paths().active.exists(), "active marker must be cleared");
    for n in 1..=3 {
        let dir = ws.paths().session_archive(n);
        assert!(dir.join("prompt.md").is_file(), "archive {n} missing prompt");
        assert!(dir.join("meta.json").is_file(), "archive {n} missing meta");
    }

    let status = load_status(&ws.paths().status).expect("load").expect("status");
    assert_eq!(status.phase, Phase::Completed);
    assert_eq!(status.session, 3);
}

#[test]
fn later_prompts_carry_the_previous_next_task() {
    let ws = TestWorkspace::new().expect("workspace");
    let launcher = ScriptedLauncher::new(vec![
        ScriptedSession::handoff("Implement the tokenizer for numbers."),
        ScriptedSession::complete("COMPLETE"),
    ]);

    run_relay(
        &ws.options(fast_config(), "Build a calculator."),
        &launcher,
        &no_verify(),
        &CancelFlag::new(),
        |_| {},
    )
    .expect("relay");

    let requests = launcher.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].prompt.contains("Build a calculator."));
    assert!(!requests[0].prompt.contains("## Next Task"));
    assert!(requests[1].prompt.contains("Implement the tokenizer for numbers."));
    assert!(requests[1].prompt.contains("session 2 of at most 10"));
}

#[test]
fn already_complete_progress_runs_no_sessions() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.store()
        .write_progress("STATUS: COMPLETE\n")
        .expect("progress");
    let launcher = ScriptedLauncher::new(Vec::new());

    let outcome = run_relay(
        &ws.options(fast_config(), "task"),
        &launcher,
        &no_verify(),
        &CancelFlag::new(),
        |_| {},
    )
    .expect("relay");

    assert_eq!(outcome.stop, RelayStop::Completed);
    assert_eq!(outcome.attempts, 0);
    assert!(launcher.requests().is_empty());
}

#[test]
fn max_sessions_stops_the_relay() {
    let ws = TestWorkspace::new().expect("workspace");
    let mut config = fast_config();
    config.relay.max_sessions = 2;
    let launcher = ScriptedLauncher::new(vec![
        ScriptedSession::handoff("Refactor module one of the codebase."),
        ScriptedSession::handoff("Now add the tests for the storage layer."),
        ScriptedSession::handoff("unused"),
    ]);

    let outcome = run_relay(
        &ws.options(config, "task"),
        &launcher,
        &no_verify(),
        &CancelFlag::new(),
        |_| {},
    )
    .expect("relay");

    assert_eq!(outcome.stop, RelayStop::MaxSessions { sessions: 2 });
    assert_eq!(launcher.remaining(), 1);
}

#[test]
fn rate_limited_attempts_do_not_consume_an_ordinal() {
    let ws = TestWorkspace::new().expect("workspace");
    let launcher = ScriptedLauncher::new(vec![
        ScriptedSession::handoff("Step one of the migration."),
        ScriptedSession::rate_limited("API Error: Rate limit reached"),
        ScriptedSession::rate_limited("429 Too Many Requests"),
        ScriptedSession::complete("COMPLETE"),
    ]);
    let mut outcomes = Vec::new();

    let outcome = run_relay(
        &ws.options(fast_config(), "Migrate the schema."),
        &launcher,
        &no_verify(),
        &CancelFlag::new(),
        |event| outcomes.push((event.session, event.outcome.phase())),
    )
    .expect("relay");

    assert_eq!(outcome.stop, RelayStop::Completed);
    assert_eq!(outcome.last_session, 2);
    assert_eq!(outcome.attempts, 4);
    assert_eq!(
        outcomes,
        vec![
            (1, Phase::HandedOff),
            (2, Phase::RateLimited),
            (2, Phase::RateLimited),
            (2, Phase::HandedOff),
        ]
    );
    let ordinals: Vec<u32> = launcher.requests().iter().map(|r| r.session).collect();
    assert_eq!(ordinals, vec![1, 2, 2, 2]);
}

#[test]
fn three_consecutive_crashes_stop_the_relay() {
    let ws = TestWorkspace::new().expect("workspace");
    let launcher = ScriptedLauncher::new(vec![
        ScriptedSession::crash(),
        ScriptedSession::crash(),
        ScriptedSession::crash(),
        ScriptedSession::handoff("never reached"),
    ]);

    let outcome = run_relay(
        &ws.options(fast_config(), "task"),
        &launcher,
        &no_verify(),
        &CancelFlag::new(),
        |_| {},
    )
    .expect("relay");

    match outcome.stop {
        RelayStop::CrashLimit { session, reason } => {
            assert_eq!(session, 3);
            assert!(reason.contains("without a handoff"), "reason: {reason}");
        }
        other => panic!("expected crash limit, got {other:?}"),
    }
    assert_eq!(launcher.remaining(), 1);
    let status = load_status(&ws.paths().status).expect("load").expect("status");
    assert_eq!(status.phase, Phase::Stuck);
}

#[test]
fn a_handoff_resets_the_crash_counter() {
    let ws = TestWorkspace::new().expect("workspace");
    let launcher = ScriptedLauncher::new(vec![
        ScriptedSession::crash(),
        ScriptedSession::crash(),
        ScriptedSession::handoff("Continue with the second half of the port."),
        ScriptedSession::crash(),
        ScriptedSession::crash(),
        ScriptedSession::complete("COMPLETE"),
    ]);

    let outcome = run_relay(
        &ws.options(fast_config(), "task"),
        &launcher,
        &no_verify(),
        &CancelFlag::new(),
        |_| {},
    )
    .expect("relay");

    assert_eq!(outcome.stop, RelayStop::Completed);
    assert_eq!(outcome.last_session, 6);
}

#[test]
fn repeated_next_tasks_stop_as_stuck_in_loop() {
    let ws = TestWorkspace::new().expect("workspace");
    let same = "Fix the failing integration test in tests/api.rs.\nRun the suite again.\n";
    let launcher = ScriptedLauncher::new(vec![
        ScriptedSession::handoff(same),
        ScriptedSession::handoff(same),
        ScriptedSession::handoff(same),
        ScriptedSession::handoff(same),
        ScriptedSession::handoff("unused"),
    ]);

    let outcome = run_relay(
        &ws.options(fast_config(), "task"),
        &launcher,
        &no_verify(),
        &CancelFlag::new(),
        |_| {},
    )
    .expect("relay");

    // Session 1 has nothing to compare with; sessions 2, 3 and 4 each repeat.
    assert_eq!(outcome.stop, RelayStop::StuckInLoop { session: 4 });
    assert_eq!(launcher.remaining(), 1);
}

#[test]
fn silent_work_is_rescued_and_the_relay_continues() {
    let ws = TestWorkspace::new().expect("workspace");
    let launcher = ScriptedLauncher::new(vec![
        ScriptedSession::handoff("Add the config loader."),
        ScriptedSession::silent_work(&["Read", "Edit", "Bash"]),
        ScriptedSession::complete("COMPLETE"),
    ]);
    let mut phases = Vec::new();

    let outcome = run_relay(
        &ws.options(fast_config(), "task"),
        &launcher,
        &no_verify(),
        &CancelFlag::new(),
        |event| phases.push(event.outcome.phase()),
    )
    .expect("relay");

    assert_eq!(outcome.stop, RelayStop::Completed);
    assert_eq!(phases, vec![Phase::HandedOff, Phase::Rescued, Phase::HandedOff]);

    let rescued_next = fs::read_to_string(ws.paths().session_archive(2).join("next_task.md"))
        .expect("archived next task");
    assert!(rescued_next.contains("Add the config loader."));
    assert!(rescued_next.contains("version-control history"));
    let third_prompt = &launcher.requests()[2].prompt;
    assert!(third_prompt.contains("Recover from session 2"));

    let kb = ws.store().read_knowledge().expect("kb");
    assert!(kb.contains("### Session 2 (rescue)"));
}

#[test]
fn verification_pass_stops_the_relay() {
    let ws = TestWorkspace::new().expect("workspace");
    let mut config = fast_config();
    config.relay.verify_command = Some("make test".to_string());
    let launcher = ScriptedLauncher::new(vec![
        ScriptedSession::handoff("Make the remaining two tests pass."),
        ScriptedSession::handoff("Fix the last flaky assertion in the tests."),
        ScriptedSession::handoff("unused"),
    ]);
    let verifier = ScriptedVerifier::new(vec![false, true]);

    let outcome = run_relay(
        &ws.options(config, "task"),
        &launcher,
        &verifier,
        &CancelFlag::new(),
        |_| {},
    )
    .expect("relay");

    assert_eq!(outcome.stop, RelayStop::Verified);
    assert_eq!(verifier.calls(), 2);
    assert!(ws.paths().session_archive(2).join("verify.log").is_file());
}

#[test]
fn interrupt_stops_and_persists_status() {
    let ws = TestWorkspace::new().expect("workspace");
    let cancel = CancelFlag::new();
    let launcher = ScriptedLauncher::new(vec![
        ScriptedSession::handoff("First chunk of work."),
        ScriptedSession::interrupted(),
        ScriptedSession::handoff("unused"),
    ])
    .with_cancel(cancel.clone());

    let outcome = run_relay(
        &ws.options(fast_config(), "task"),
        &launcher,
        &no_verify(),
        &cancel,
        |_| {},
    )
    .expect("relay");

    assert_eq!(outcome.stop, RelayStop::Interrupted);
    assert_eq!(launcher.remaining(), 1);
    let status = load_status(&ws.paths().status).expect("load").expect("status");
    assert_eq!(status.phase, Phase::Interrupted);
    assert!(!ws.paths().active.exists());
}

#[test]
fn knowledge_log_is_pruned_before_each_prompt() {
    let ws = TestWorkspace::new().expect("workspace");
    let mut text = String::from("# Knowledge Base\n\n## Core Knowledge\n\n- keep me\n\n## Session Log\n\n");
    for i in 1..=8 {
        text.push_str(&format!("### Session {i}\n\nnotes {i}\n\n"));
    }
    ws.store().write_knowledge(&text).expect("kb");
    let mut config = fast_config();
    config.relay.knowledge_keep = 3;
    let launcher = ScriptedLauncher::new(vec![ScriptedSession::complete("COMPLETE")]);

    run_relay(
        &ws.options(config, "task"),
        &launcher,
        &no_verify(),
        &CancelFlag::new(),
        |_| {},
    )
    .expect("relay");

    let kb = ws.store().read_knowledge().expect("kb");
    assert_eq!(knowledge::log_entry_count(&kb), Some(3));
    assert!(kb.contains("- keep me"));
    assert!(launcher.requests()[0].prompt.contains("- keep me"));
}

#[test]
fn relay_resumes_from_the_persisted_counter() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.store().write_session_count(4).expect("count");
    let launcher = ScriptedLauncher::new(vec![ScriptedSession::complete("COMPLETE")]);

    let outcome = run_relay(
        &ws.options(fast_config(), "task"),
        &launcher,
        &no_verify(),
        &CancelFlag::new(),
        |_| {},
    )
    .expect("relay");

    assert_eq!(outcome.last_session, 5);
    assert_eq!(launcher.requests()[0].session, 5);
}
