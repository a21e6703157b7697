//! Sub-view composition: component state, prefixed event routing, and
//! nested patches.

use std::time::Duration;

use anyhow::anyhow;
use serde::Serialize;
use serde_json::json;
use tokio::time;

use livewire_core::protocol::ServerFrame;
use livewire_core::tree::{Dynamic, PatchValue};
use livewire_core::Template;
use livewire_server::testing::TestClient;
use livewire_server::{Component, LiveConfig, LiveView};

#[derive(Clone, Serialize)]
struct Dashboard {
    title: String,
}

fn dashboard() -> LiveView<Dashboard> {
    let template = Template::parse("<div>{{.title}}: {{component \"clock\"}}</div>").unwrap();
    let clock = Component::new("clock", Template::parse("<time>{{.}}</time>").unwrap())
        .mount(|| json!("12:00"))
        .on("tick", |_socket, _state, data| async move {
            match data.get("time").and_then(|v| v.as_str()) {
                Some(time) => Ok(json!(time)),
                None => Err(anyhow!("missing time")),
            }
        });
    LiveView::with_template(
        |_socket| async move {
            Ok(Dashboard {
                title: "demo".into(),
            })
        },
        template,
    )
    .component(clock)
}

#[tokio::test]
async fn component_renders_as_nested_subtree() {
    let mut client = TestClient::connect(dashboard(), LiveConfig::default());
    match client.recv().await {
        ServerFrame::Render { d } => {
            assert_eq!(d.dynamics.len(), 2);
            assert_eq!(d.dynamics[0], Dynamic::Text("demo".into()));
            match &d.dynamics[1] {
                Dynamic::Tree(sub) => assert_eq!(sub.to_html(), "<time>12:00</time>"),
                other => panic!("expected subtree, got {other:?}"),
            }
        }
        other => panic!("expected baseline render, got {other:?}"),
    }
    client.close().await;
}

#[tokio::test]
async fn prefixed_events_route_to_the_component_table() {
    let mut client = TestClient::connect(dashboard(), LiveConfig::default());
    client.recv().await; // baseline

    client.event("clock:tick", json!({ "time": "12:01" }), "1").await;
    match client.recv().await {
        ServerFrame::Patch { d } => {
            // Only the changed subtree's dynamics travel.
            assert_eq!(d.0.len(), 1);
            match d.0.get(&1) {
                Some(PatchValue::Patch(nested)) => {
                    assert_eq!(nested.0.get(&0), Some(&PatchValue::Text("12:01".into())));
                }
                other => panic!("expected nested patch, got {other:?}"),
            }
        }
        other => panic!("expected patch, got {other:?}"),
    }
    assert_eq!(client.recv().await, ServerFrame::Ack { i: "1".into() });

    client.close().await;
}

#[tokio::test]
async fn unknown_component_event_is_dropped() {
    let mut client = TestClient::connect(dashboard(), LiveConfig::default());
    client.recv().await; // baseline

    client.event("clock:nope", json!({}), "2").await;
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.try_recv(), None);
    assert!(!client.is_closed());

    client.close().await;
}

#[tokio::test]
async fn failing_component_handler_preserves_component_state() {
    let mut client = TestClient::connect(dashboard(), LiveConfig::default());
    client.recv().await; // baseline

    // Missing payload makes the tick handler fail.
    client.event("clock:tick", json!({}), "3").await;
    match client.recv().await {
        ServerFrame::Push { d } => {
            assert_eq!(d.event, "err");
            assert_eq!(d.payload["id"], json!("3"));
        }
        other => panic!("expected err push, got {other:?}"),
    }

    // The clock still reads its mount-time value, so a real tick patches
    // from there.
    client.event("clock:tick", json!({ "time": "12:05" }), "4").await;
    match client.recv().await {
        ServerFrame::Patch { d } => match d.0.get(&1) {
            Some(PatchValue::Patch(nested)) => {
                assert_eq!(nested.0.get(&0), Some(&PatchValue::Text("12:05".into())));
            }
            other => panic!("expected nested patch, got {other:?}"),
        },
        other => panic!("expected patch, got {other:?}"),
    }

    client.close().await;
}
