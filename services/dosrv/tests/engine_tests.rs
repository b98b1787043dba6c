//! Execution engine state machine against scripted devices

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::time::Duration;

use common::{device, fast_settings, Harness, Op, COIL, DEVICE_ID};
use dosrv::engine::{ExecutionSettings, FailureReason, Outcome};
use dosrv::model::{CommandAction, EventLevel, ExecutionResult, EVENT_DO_CONTROL, EVENT_DO_CONTROL_FAILED};
use dosrv::store::CommandQueue;
use voltage_protocols::LinkError;

fn exception() -> LinkError {
    LinkError::Exception {
        function: 0x06,
        code: 0x04,
    }
}

#[tokio::test]
async fn test_on_command_writes_verifies_and_records() {
    let h = Harness::new(false);
    let command = h.enqueue(CommandAction::On, Some("source=admin")).await;

    let report = h.engine.execute(&command).await.unwrap();
    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.attempts, 1);
    assert_eq!(report.retry_count, 0);
    assert!(report.persisted);

    assert_eq!(
        h.connector.ops(),
        vec![
            Op::Connect,
            Op::WriteRegister(60008, 256),
            Op::ReadHolding(207),
            Op::Close,
        ]
    );

    let stored = h.store.get_command(command.id).await.unwrap().unwrap();
    assert_eq!(stored.result, ExecutionResult::Success);
    assert!(stored.error_message.is_none());
    assert!(stored.executed_at.is_some());

    let status = h.store.status(DEVICE_ID, COIL).unwrap();
    assert_eq!(status.state, Some(true));
    assert_eq!(status.update_source, "admin");

    let events = h.store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EVENT_DO_CONTROL);
    assert_eq!(events[0].level, EventLevel::Info);
    assert_eq!(events[0].message, "DO ON");
    assert_eq!(events[0].metadata["type"], "manual");
    assert_eq!(events[0].metadata["requested_state"], true);
    assert_eq!(events[0].metadata["read_back"], 1);
    assert_eq!(events[0].metadata["write_register"], 60008);
}

#[tokio::test]
async fn test_cached_state_matching_skips_device_io() {
    let h = Harness::new(true);
    h.store.set_status(DEVICE_ID, COIL, Some(true));
    let command = h.enqueue(CommandAction::On, None).await;

    let report = h.engine.execute(&command).await.unwrap();
    assert_eq!(report.outcome, Outcome::Skipped);
    assert!(h.connector.ops().is_empty());
    assert_eq!(h.connector.script().writes(), 0);

    let stored = h.store.get_command(command.id).await.unwrap().unwrap();
    assert_eq!(stored.result, ExecutionResult::Success);

    let status = h.store.status(DEVICE_ID, COIL).unwrap();
    assert_eq!(status.state, Some(true));
    assert_eq!(status.update_source, "system");

    let events = h.store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].metadata["skipped"], true);
}

#[tokio::test]
async fn test_readback_mismatch_fails() {
    let h = Harness::new(false);
    h.connector.script().stuck = true;
    let command = h.enqueue(CommandAction::On, None).await;

    let report = h.engine.execute(&command).await.unwrap();
    assert_eq!(report.outcome, Outcome::Failed(FailureReason::ReadbackMismatch));

    let stored = h.store.get_command(command.id).await.unwrap().unwrap();
    assert_eq!(stored.result, ExecutionResult::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("readback_mismatch"));

    // Cache follows what the device reported
    assert_eq!(h.store.status(DEVICE_ID, COIL).unwrap().state, Some(false));

    let events = h.store.events();
    assert_eq!(events[0].event_type, EVENT_DO_CONTROL_FAILED);
    assert_eq!(events[0].level, EventLevel::Error);
    assert_eq!(events[0].message, "DO ON failed: readback_mismatch");
}

#[tokio::test]
async fn test_timeout_drops_link_and_next_attempt_reconnects() {
    let h = Harness::new(false);
    h.connector
        .script()
        .register_write_failures
        .push_back(LinkError::timeout("no response"));
    let command = h.enqueue(CommandAction::On, None).await;

    let report = h.engine.execute(&command).await.unwrap();
    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.attempts, 2);
    assert_eq!(report.retry_count, 1);
    assert_eq!(
        h.connector.ops(),
        vec![
            Op::Connect,
            Op::WriteRegister(60008, 256),
            Op::Connect,
            Op::WriteRegister(60008, 256),
            Op::ReadHolding(207),
            Op::Close,
        ]
    );
}

#[tokio::test]
async fn test_exhausted_primary_falls_back_to_coil() {
    let h = Harness::new(false);
    {
        let mut script = h.connector.script();
        for _ in 0..3 {
            script.register_write_failures.push_back(exception());
        }
    }
    let command = h.enqueue(CommandAction::On, None).await;

    let report = h.engine.execute(&command).await.unwrap();
    assert_eq!(report.outcome, Outcome::Succeeded);
    assert!(report.fallback_used);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.retry_count, 3);

    let script = h.connector.script();
    // Exception responses keep the socket
    assert_eq!(script.count(|op| *op == Op::Connect), 1);
    assert_eq!(script.count(|op| matches!(op, Op::WriteRegister(..))), 3);
    assert_eq!(script.count(|op| *op == Op::WriteCoil(COIL, true)), 1);
}

#[tokio::test]
async fn test_fallback_failure_reports_last_error_and_invalidates_cache() {
    let h = Harness::new(false);
    h.store.set_status(DEVICE_ID, COIL, Some(false));
    {
        let mut script = h.connector.script();
        for _ in 0..3 {
            script.register_write_failures.push_back(exception());
        }
        script.coil_write_failure = Some(LinkError::Exception {
            function: 0x05,
            code: 0x02,
        });
    }
    let command = h.enqueue(CommandAction::On, None).await;

    let report = h.engine.execute(&command).await.unwrap();
    let reason = report.outcome.failure().unwrap().to_string();
    assert_eq!(
        reason,
        "attempt_failed:fallback:Modbus exception: function 0x05, code 0x02"
    );
    assert_eq!(h.connector.script().count(|op| matches!(op, Op::ReadHolding(_))), 0);

    let stored = h.store.get_command(command.id).await.unwrap().unwrap();
    assert_eq!(stored.result, ExecutionResult::Failed);
    assert_eq!(stored.retry_count, 3);
    assert_eq!(stored.error_message.as_deref(), Some(reason.as_str()));

    assert_eq!(h.store.status(DEVICE_ID, COIL).unwrap().state, None);
}

#[tokio::test]
async fn test_connect_failures_consume_attempts() {
    let h = Harness::new(false);
    {
        let mut script = h.connector.script();
        for _ in 0..4 {
            script
                .connect_failures
                .push_back(LinkError::connection("refused"));
        }
    }
    let command = h.enqueue(CommandAction::Off, None).await;

    let report = h.engine.execute(&command).await.unwrap();
    assert_eq!(
        report.outcome,
        Outcome::Failed(FailureReason::ConnectFailed("10.0.0.5".to_string()))
    );
    assert_eq!(report.attempts, 3);
    assert!(report.fallback_used);
    assert_eq!(h.connector.ops(), vec![Op::Connect; 4]);

    let stored = h.store.get_command(command.id).await.unwrap().unwrap();
    assert_eq!(stored.error_message.as_deref(), Some("connect_failed:10.0.0.5"));
}

#[tokio::test]
async fn test_non_positive_max_retries_uses_default() {
    let h = Harness::with_settings(
        false,
        ExecutionSettings {
            default_max_retries: 2,
            ..fast_settings()
        },
    );
    {
        let mut script = h.connector.script();
        for _ in 0..5 {
            script.register_write_failures.push_back(exception());
        }
    }
    let mut command = h.enqueue(CommandAction::On, None).await;
    command.max_retries = 0;

    let report = h.engine.execute(&command).await.unwrap();
    assert_eq!(report.attempts, 2);
    assert!(report.fallback_used);
}

#[tokio::test]
async fn test_unknown_command_fails_without_io() {
    let h = Harness::new(false);
    h.store.set_status(DEVICE_ID, COIL, Some(false));
    let command = h
        .enqueue(CommandAction::Unrecognized("PULSE".to_string()), None)
        .await;

    let report = h.engine.execute(&command).await.unwrap();
    assert_eq!(
        report.outcome,
        Outcome::Failed(FailureReason::UnknownCommand("PULSE".to_string()))
    );
    assert!(h.connector.ops().is_empty());

    let stored = h.store.get_command(command.id).await.unwrap().unwrap();
    assert_eq!(stored.error_message.as_deref(), Some("unknown_command:PULSE"));
    // Cache untouched
    assert_eq!(h.store.status(DEVICE_ID, COIL).unwrap().update_source, "seed");
    assert_eq!(h.store.events()[0].message, "DO UNKNOWN failed: unknown_command:PULSE");
}

#[tokio::test]
async fn test_missing_target_fails() {
    let h = Harness::new(false);
    let mut no_host = device(DEVICE_ID);
    no_host.host = String::new();
    h.store.upsert_device(no_host);
    let command = h.enqueue(CommandAction::On, None).await;

    let report = h.engine.execute(&command).await.unwrap();
    assert_eq!(report.outcome, Outcome::Failed(FailureReason::MissingTarget));
    assert!(h.connector.ops().is_empty());
    assert!(h.store.status(DEVICE_ID, COIL).is_none());

    let stored = h.store.get_command(command.id).await.unwrap().unwrap();
    assert_eq!(stored.error_message.as_deref(), Some("missing_analyzer_ip"));
}

#[tokio::test]
async fn test_toggle_inverts_cache_and_defaults_to_on() {
    let h = Harness::new(false);

    let first = h.enqueue(CommandAction::Toggle, None).await;
    let report = h.engine.execute(&first).await.unwrap();
    assert_eq!(report.desired_state, Some(true));
    assert_eq!(report.outcome, Outcome::Succeeded);

    let second = h.enqueue(CommandAction::Toggle, None).await;
    let report = h.engine.execute(&second).await.unwrap();
    assert_eq!(report.previous_state, Some(true));
    assert_eq!(report.desired_state, Some(false));
    assert_eq!(report.outcome, Outcome::Succeeded);
    assert!(!h.connector.script().state);
}

#[tokio::test]
async fn test_status_read_falls_back_to_discrete_input() {
    let h = Harness::new(false);
    h.connector.script().holding_read_failure = Some(LinkError::Exception {
        function: 0x03,
        code: 0x02,
    });
    let command = h.enqueue(CommandAction::On, None).await;

    let report = h.engine.execute(&command).await.unwrap();
    assert_eq!(report.outcome, Outcome::Succeeded);
    assert!(h.connector.ops().contains(&Op::ReadDiscrete(400)));
    assert_eq!(h.store.events()[0].metadata["read_back_source"], "discrete_input");
}

#[tokio::test]
async fn test_missing_readback_fails_and_clears_cache() {
    let h = Harness::new(false);
    h.store.set_status(DEVICE_ID, COIL, Some(false));
    {
        let mut script = h.connector.script();
        script.holding_read_failure = Some(LinkError::protocol("short frame"));
        script.discrete_read_failure = Some(LinkError::protocol("short frame"));
    }
    let command = h.enqueue(CommandAction::On, None).await;

    let report = h.engine.execute(&command).await.unwrap();
    assert_eq!(report.outcome, Outcome::Failed(FailureReason::ReadbackMissing));
    // The device did switch, but nothing confirmed it
    assert!(h.connector.script().state);
    assert_eq!(h.store.status(DEVICE_ID, COIL).unwrap().state, None);
}

#[tokio::test]
async fn test_terminal_status_is_never_rewritten() {
    let h = Harness::new(false);
    let command = h.enqueue(CommandAction::On, None).await;

    let first = h.engine.execute(&command).await.unwrap();
    assert!(first.persisted);

    h.connector.script().stuck = true;
    let again = h.enqueue(CommandAction::Off, None).await;
    // Re-run the first, already SUCCESS command with a now-failing device
    let mut stale = again.clone();
    stale.id = command.id;
    let second = h.engine.execute(&stale).await.unwrap();
    assert!(!second.persisted);

    let stored = h.store.get_command(command.id).await.unwrap().unwrap();
    assert_eq!(stored.result, ExecutionResult::Success);
    assert!(stored.error_message.is_none());
}

#[tokio::test]
async fn test_register_override_from_notes() {
    let h = Harness::new(false);
    let command = h
        .enqueue(CommandAction::On, Some("reg=40001;source=auto_restore"))
        .await;

    h.engine.execute(&command).await.unwrap();
    assert!(h.connector.ops().contains(&Op::WriteRegister(40001, 256)));
    let events = h.store.events();
    assert_eq!(events[0].metadata["type"], "auto");
    assert_eq!(events[0].source, "auto_restore");
}

#[tokio::test(start_paused = true)]
async fn test_default_retry_delay_spaces_primary_attempts_only() {
    let h = Harness::with_settings(false, ExecutionSettings::default());
    {
        let mut script = h.connector.script();
        for _ in 0..3 {
            script.register_write_failures.push_back(exception());
        }
    }
    let command = h.enqueue(CommandAction::On, None).await;

    let started = tokio::time::Instant::now();
    let report = h.engine.execute(&command).await.unwrap();

    // Two 1s pauses between three FC06 attempts, none before the FC05 write
    assert_eq!(started.elapsed(), Duration::from_secs(2));
    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.retry_count, 3);
    assert_eq!(h.connector.script().count(|op| *op == Op::WriteCoil(COIL, true)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_success_on_second_attempt_waits_one_retry_delay() {
    let h = Harness::with_settings(false, ExecutionSettings::default());
    h.connector
        .script()
        .register_write_failures
        .push_back(exception());
    let command = h.enqueue(CommandAction::On, None).await;

    let started = tokio::time::Instant::now();
    let report = h.engine.execute(&command).await.unwrap();

    assert_eq!(started.elapsed(), Duration::from_secs(1));
    assert_eq!(report.attempts, 2);
    assert_eq!(h.connector.script().count(|op| matches!(op, Op::WriteCoil(..))), 0);
}
