//! Subscription sharing, snapshots and fan-out against the mock console.

mod common;

use std::sync::Arc;

use common::{connected, eventually, MockConsole};
use faderproto::{Method, ParamValue, ValueFormat};
use faderwire::{Freshness, LinkError};
use futures::future::join_all;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_concurrent_subscribers_share_one_wire_subscription() {
    let console = MockConsole::new().with_value("ch.0.mix.lvl", ValueFormat::Norm, 0.5);
    let client = Arc::new(connected(&console).await);

    let subscribes = (0..5).map(|_| {
        let client = Arc::clone(&client);
        async move { client.subscribe("ch.0.mix.lvl", ValueFormat::Norm).await }
    });
    let subs: Vec<_> = join_all(subscribes)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .expect("all subscribes succeed");

    assert_eq!(console.requests_with(Method::Subscribe).len(), 1);
    let handle = subs[0].handle();
    assert!(subs.iter().all(|s| s.handle() == handle));
    assert_eq!(client.refcount(handle), 5);
    assert_eq!(client.registry().len(), 1);
}

#[tokio::test]
async fn test_concurrent_subscribers_on_distinct_paths() {
    const CHANNELS: usize = 8;
    const ROUNDS: usize = 3;
    let console = MockConsole::new();
    let client = Arc::new(connected(&console).await);

    let level = |ch: usize, round: usize| round as f64 + ch as f64 / 10.0;
    let tasks: Vec<_> = (0..CHANNELS)
        .map(|ch| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let path = format!("ch.{}.mix.lvl", ch);
                let mut sub = client.subscribe(&path, ValueFormat::Val).await.unwrap();
                let mut seen = Vec::new();
                while seen.len() < ROUNDS {
                    let update = sub.recv().await.unwrap();
                    assert_eq!(update.path, path);
                    seen.push(update.value);
                }
                seen
            })
        })
        .collect();

    assert!(eventually(|| client.registry().len() == CHANNELS).await);
    assert!(eventually(|| console.subscriptions().len() == CHANNELS).await);
    for round in 0..ROUNDS {
        for ch in 0..CHANNELS {
            console.change(&format!("ch.{}.mix.lvl", ch), ValueFormat::Val, level(ch, round));
        }
    }

    for (ch, task) in tasks.into_iter().enumerate() {
        let seen = tokio::time::timeout(common::WAIT, task).await.unwrap().unwrap();
        let expected: Vec<ParamValue> = (0..ROUNDS)
            .map(|round| ParamValue::Number(level(ch, round)))
            .collect();
        assert_eq!(seen, expected);
    }
    assert_eq!(console.requests_with(Method::Subscribe).len(), CHANNELS);
}

#[tokio::test]
async fn test_every_consumer_gets_the_snapshot() {
    let console = MockConsole::new()
        .with_value("ch.0.mix.lvl", ValueFormat::Norm, 0.5)
        .with_value("ch.1.mix.lvl", ValueFormat::Norm, 0.25)
        .with_value("ch.0.mix.lvl", ValueFormat::Val, -6.0);
    let client = connected(&console).await;

    let mut first = client.subscribe("ch.*.mix.lvl", ValueFormat::Norm).await.unwrap();
    let mut second = client.subscribe("ch.*.mix.lvl", ValueFormat::Norm).await.unwrap();

    for sub in [&mut first, &mut second] {
        let a = sub.try_recv().expect("first snapshot value");
        let b = sub.try_recv().expect("second snapshot value");
        assert_eq!(a.path, "ch.0.mix.lvl");
        assert_eq!(b.path, "ch.1.mix.lvl");
        assert!(sub.try_recv().is_none(), "other formats are not included");
    }

    // The snapshot is in the mirror before subscribe returns
    assert_eq!(
        client.get("ch.1.mix.lvl", ValueFormat::Norm).unwrap().value,
        ParamValue::Number(0.25)
    );
}

#[tokio::test]
async fn test_unsubscribe_goes_to_the_wire_only_at_zero() {
    let console = MockConsole::new();
    let client = connected(&console).await;

    let a = client.subscribe("ch.*.mix.mute", ValueFormat::Val).await.unwrap();
    let b = client.subscribe("ch.*.mix.mute", ValueFormat::Val).await.unwrap();
    let handle = a.handle();
    assert_eq!(console.subscriptions().len(), 1);

    client.unsubscribe(a).await.unwrap();
    assert_eq!(client.refcount(handle), 1);
    assert!(console.requests_with(Method::Unsubscribe).is_empty());

    client.unsubscribe(b).await.unwrap();
    assert_eq!(client.refcount(handle), 0);
    assert_eq!(console.requests_with(Method::Unsubscribe).len(), 1);
    assert!(console.subscriptions().is_empty());
    assert!(client.registry().is_empty());
}

#[tokio::test]
async fn test_formats_are_separate_subscriptions() {
    let console = MockConsole::new();
    let client = connected(&console).await;

    let norm = client.subscribe("ch.0.mix.lvl", ValueFormat::Norm).await.unwrap();
    let val = client.subscribe("ch.0.mix.lvl", ValueFormat::Val).await.unwrap();

    assert_ne!(norm.handle(), val.handle());
    assert_eq!(console.requests_with(Method::Subscribe).len(), 2);
}

#[tokio::test]
async fn test_push_fans_out_to_overlapping_patterns() {
    let console = MockConsole::new();
    let client = connected(&console).await;

    let mut levels = client.subscribe("ch.*.mix.lvl", ValueFormat::Norm).await.unwrap();
    let mut channel0 = client.subscribe("ch.0.mix.*", ValueFormat::Norm).await.unwrap();
    let mut everything = client.subscribe("**", ValueFormat::Norm).await.unwrap();

    console.change("ch.0.mix.lvl", ValueFormat::Norm, 0.3);

    let got = levels.recv().await.unwrap();
    assert_eq!(got.path, "ch.0.mix.lvl");
    assert_eq!(got.value, ParamValue::Number(0.3));
    assert_eq!(channel0.recv().await.unwrap().path, "ch.0.mix.lvl");
    assert_eq!(everything.recv().await.unwrap().path, "ch.0.mix.lvl");

    console.change("ch.1.mix.lvl", ValueFormat::Norm, 0.6);
    assert_eq!(levels.recv().await.unwrap().path, "ch.1.mix.lvl");
    assert_eq!(everything.recv().await.unwrap().path, "ch.1.mix.lvl");
    assert!(channel0.try_recv().is_none());
}

#[tokio::test]
async fn test_unmatched_push_only_updates_the_mirror() {
    let console = MockConsole::new();
    let client = connected(&console).await;
    let mut sub = client.subscribe("ch.0.mix.lvl", ValueFormat::Norm).await.unwrap();

    // Nobody subscribes to pans, but the console may push them anyway
    console.push(faderproto::Envelope::push(
        "ch.3.mix.pan",
        faderproto::Body::Value {
            format: ValueFormat::Norm,
            value: ParamValue::Number(0.5),
        },
    ));

    assert!(
        eventually(|| client.freshness("ch.3.mix.pan", ValueFormat::Norm) == Freshness::Fresh)
            .await
    );
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_refused_subscribe_fails_every_waiter() {
    let console = MockConsole::new();
    console.reject("ch.99.mix.lvl", "not_found", "no such channel");
    let client = Arc::new(connected(&console).await);

    let attempts = (0..3).map(|_| {
        let client = Arc::clone(&client);
        async move { client.subscribe("ch.99.mix.lvl", ValueFormat::Norm).await }
    });
    for result in join_all(attempts).await {
        match result {
            Err(LinkError::Subscription { code, .. }) => assert_eq!(code, "not_found"),
            other => panic!("expected subscription error, got {:?}", other.map(|s| s.handle())),
        }
    }
    assert!(client.registry().is_empty());

    // A later attempt starts fresh
    let before = console.requests_with(Method::Subscribe).len();
    let _ = client.subscribe("ch.99.mix.lvl", ValueFormat::Norm).await;
    assert_eq!(console.requests_with(Method::Subscribe).len(), before + 1);
}

#[tokio::test]
async fn test_invalid_pattern_never_reaches_the_wire() {
    let console = MockConsole::new();
    let client = connected(&console).await;

    let err = client.subscribe("ch..lvl", ValueFormat::Norm).await.unwrap_err();
    assert!(matches!(err, LinkError::InvalidPattern(_)));
    assert!(console.requests_with(Method::Subscribe).is_empty());
}

#[tokio::test]
async fn test_dropped_subscription_is_released_on_next_push() {
    let console = MockConsole::new();
    let client = connected(&console).await;

    let sub = client.subscribe("ch.0.mix.lvl", ValueFormat::Norm).await.unwrap();
    drop(sub);

    console.change("ch.0.mix.lvl", ValueFormat::Norm, 0.1);

    assert!(eventually(|| console.requests_with(Method::Unsubscribe).len() == 1).await);
    assert!(client.registry().is_empty());
}
