//! Request/reply correlation, timeouts and optimistic writes.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{connected, eventually, MockConsole};
use faderproto::{Body, Envelope, Method, ParamValue, ValueFormat};
use faderwire::{ConnectionState, Freshness, LinkError, ValueOrigin};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_fetch_returns_and_mirrors_value() {
    let console = MockConsole::new().with_value("ch.2.mix.lvl", ValueFormat::Val, -12.5);
    let client = connected(&console).await;

    let value = client.fetch("ch.2.mix.lvl", ValueFormat::Val).await.unwrap();
    assert_eq!(value.value, ParamValue::Number(-12.5));
    assert_eq!(value.origin, ValueOrigin::Server);
    assert_eq!(
        client.get("ch.2.mix.lvl", ValueFormat::Val).unwrap().value,
        ParamValue::Number(-12.5)
    );
}

#[tokio::test]
async fn test_concurrent_requests_are_correlated() {
    let console = MockConsole::new();
    for ch in 0..8 {
        console.set_value(&format!("ch.{}.cfg.name", ch), ValueFormat::Val, format!("Input {}", ch));
    }
    let client = Arc::new(connected(&console).await);

    let mut tasks = Vec::new();
    for ch in 0..8 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            let path = format!("ch.{}.cfg.name", ch);
            let value = client.fetch(&path, ValueFormat::Val).await.unwrap();
            (ch, value.value)
        }));
    }
    for task in tasks {
        let (ch, value) = task.await.unwrap();
        assert_eq!(value, ParamValue::Text(format!("Input {}", ch)));
    }

    // Every request carried its own token
    let mut ids: Vec<u64> = console.requests().iter().filter_map(|r| r.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8);
}

#[tokio::test]
async fn test_timeout_removes_the_pending_token() {
    let console = MockConsole::new().with_value("ch.0.mix.lvl", ValueFormat::Val, 0.0);
    console.silence("ch.9.mix.lvl");
    let client = connected(&console).await;

    let err = client.fetch("ch.9.mix.lvl", ValueFormat::Val).await.unwrap_err();
    match err {
        LinkError::Timeout { operation, timeout_ms } => {
            assert_eq!(operation, "GET ch.9.mix.lvl");
            assert_eq!(timeout_ms, 500);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(client.in_flight(), 0);

    // A late reply to the timed-out token is discarded
    let late = console.requests_with(Method::Get)[0].clone();
    console.push(Envelope::reply_to(
        &late,
        Body::Value {
            format: ValueFormat::Val,
            value: ParamValue::Number(1.0),
        },
    ));
    assert!(client.fetch("ch.0.mix.lvl", ValueFormat::Val).await.is_ok());
    assert_eq!(client.freshness("ch.9.mix.lvl", ValueFormat::Val), Freshness::Unknown);
}

#[tokio::test]
async fn test_requests_fail_fast_while_offline() {
    let console = MockConsole::new();
    console.refuse_connections(true);
    let client = console.client();

    let started = Instant::now();
    let err = client.fetch("ch.0.mix.lvl", ValueFormat::Val).await.unwrap_err();
    assert_eq!(err, LinkError::not_connected());
    assert!(started.elapsed() < Duration::from_millis(100));

    let err = client.subscribe("ch.0.mix.lvl", ValueFormat::Val).await.unwrap_err();
    assert_eq!(err, LinkError::not_connected());
    assert!(client.registry().is_empty());
    assert_ne!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_pending_requests_fail_on_disconnect() {
    let console = MockConsole::new();
    console.silence("ch.0.mix.lvl");
    let client = Arc::new(connected(&console).await);

    let waiting = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.fetch("ch.0.mix.lvl", ValueFormat::Val).await })
    };
    assert!(eventually(|| client.in_flight() == 1).await);

    console.drop_connection();
    let err = waiting.await.unwrap().unwrap_err();
    assert_eq!(err, LinkError::connection_lost());
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_set_is_visible_before_confirmation() {
    let console = MockConsole::new();
    console.silence("ch.0.mix.lvl");
    let client = Arc::new(connected(&console).await);

    let setting = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.set_normalized("ch.0.mix.lvl", 0.9).await })
    };
    assert!(eventually(|| client.in_flight() == 1).await);

    let pending = client.get("ch.0.mix.lvl", ValueFormat::Norm).unwrap();
    assert_eq!(pending.value, ParamValue::Number(0.9));
    assert_eq!(pending.origin, ValueOrigin::Optimistic);
    assert!(!pending.stale);

    // The console never answers: the write is no longer trusted
    assert!(matches!(setting.await.unwrap(), Err(LinkError::Timeout { .. })));
    assert_eq!(client.freshness("ch.0.mix.lvl", ValueFormat::Norm), Freshness::Stale);
}

#[tokio::test]
async fn test_offline_set_keeps_the_last_server_value() {
    let console = MockConsole::new().with_value("ch.0.mix.lvl", ValueFormat::Norm, 0.8);
    let client = connected(&console).await;
    client.fetch("ch.0.mix.lvl", ValueFormat::Norm).await.unwrap();

    console.refuse_connections(true);
    console.drop_connection();
    assert!(eventually(|| client.state() != ConnectionState::Connected).await);

    let err = client.set_normalized("ch.0.mix.lvl", 0.1).await.unwrap_err();
    assert_eq!(err, LinkError::not_connected());

    let kept = client.get("ch.0.mix.lvl", ValueFormat::Norm).unwrap();
    assert_eq!(kept.value, ParamValue::Number(0.8));
    assert_eq!(kept.origin, ValueOrigin::Server);
    assert!(kept.stale);
    assert_eq!(console.value("ch.0.mix.lvl", ValueFormat::Norm), Some(ParamValue::Number(0.8)));
    assert!(console.requests_with(Method::Set).is_empty());

    // Never seen before: an offline SET leaves no entry behind
    client.set_normalized("ch.7.mix.lvl", 0.5).await.unwrap_err();
    assert_eq!(client.freshness("ch.7.mix.lvl", ValueFormat::Norm), Freshness::Unknown);
}

#[tokio::test]
async fn test_rejected_set_marks_value_stale() {
    let console = MockConsole::new();
    console.reject("ch.0.mix.lvl", "locked", "channel is locked");
    let client = connected(&console).await;

    let err = client.set_normalized("ch.0.mix.lvl", 0.9).await.unwrap_err();
    assert_eq!(
        err,
        LinkError::Rejected {
            code: "locked".into(),
            message: "channel is locked".into(),
        }
    );

    let v = client.get("ch.0.mix.lvl", ValueFormat::Norm).unwrap();
    assert!(v.stale);
    assert_eq!(v.value, ParamValue::Number(0.9));
}

#[tokio::test]
async fn test_acknowledged_set_is_confirmed() {
    let console = MockConsole::new();
    let client = connected(&console).await;

    client.set_normalized("ch.0.mix.lvl", 0.25).await.unwrap();
    let v = client.get("ch.0.mix.lvl", ValueFormat::Norm).unwrap();
    assert_eq!(v.origin, ValueOrigin::Server);
    assert!(!v.stale);
    assert_eq!(console.value("ch.0.mix.lvl", ValueFormat::Norm), Some(ParamValue::Number(0.25)));

    console.echo_set(true);
    client.set_plain("ch.0.cfg.name", "Kick").await.unwrap();
    assert_eq!(
        client.get("ch.0.cfg.name", ValueFormat::Val).unwrap().value,
        ParamValue::Text("Kick".into())
    );
}

#[tokio::test]
async fn test_out_of_range_normalized_value_is_refused_locally() {
    let console = MockConsole::new();
    let client = connected(&console).await;

    for bad in [1.5, -0.1, f64::NAN, f64::INFINITY] {
        let err = client.set_normalized("ch.0.mix.lvl", bad).await.unwrap_err();
        assert!(matches!(err, LinkError::InvalidValue(_)), "{} should be refused", bad);
    }
    assert!(console.requests_with(Method::Set).is_empty());
    assert!(client.get("ch.0.mix.lvl", ValueFormat::Norm).is_none());
}

#[tokio::test]
async fn test_console_info_and_app_state() {
    let console = MockConsole::new();
    let client = connected(&console).await;

    let info = client.fetch_console_info().await.unwrap();
    assert_eq!(info.model.as_deref(), Some("MX-32"));
    assert_eq!(client.mirror().console_info(), Some(info));

    let state = client.fetch_app_state().await.unwrap();
    assert_eq!(state.state, "ready");
    assert_eq!(client.mirror().app_state(), Some(state));
}

#[tokio::test]
async fn test_malformed_frames_do_not_break_the_session() {
    let console = MockConsole::new().with_value("ch.0.mix.lvl", ValueFormat::Val, 0.0);
    let client = connected(&console).await;

    console.send_raw("not json at all");
    console.send_raw(r#"{"path":"ch.0.mix.lvl","method":"PUSH","body":[1,2]}"#);
    console.send_raw(r#"{"id":424242,"path":"ch.0.mix.lvl","method":"GET","body":{"format":"val","value":1}}"#);

    assert!(client.fetch("ch.0.mix.lvl", ValueFormat::Val).await.is_ok());
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_missing_value_is_rejected() {
    let console = MockConsole::new();
    let client = connected(&console).await;

    let err = client.fetch("ch.40.mix.lvl", ValueFormat::Val).await.unwrap_err();
    assert!(matches!(err, LinkError::Rejected { ref code, .. } if code == "not_found"));
}
