//! End-to-end scenarios for the live socket event loop, driven through the
//! in-memory test client exactly as a browser would drive the wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::Serialize;
use serde_json::json;
use tokio::time;

use livewire_core::protocol::{ClientFrame, EventData, ServerFrame};
use livewire_core::tree::{Dynamic, PatchValue, RenderTree};
use livewire_core::Template;
use livewire_server::testing::TestClient;
use livewire_server::{LiveConfig, LiveView, PubSub};

#[derive(Clone, Serialize)]
struct Thermostat {
    c: f64,
}

fn thermostat() -> LiveView<Thermostat> {
    let template =
        Template::parse("<div>{{.c}}</div><button live-click=\"up\">+</button>").unwrap();
    LiveView::with_template(|_socket| async move { Ok(Thermostat { c: 19.5 }) }, template)
        .on("up", |_socket, mut state: Thermostat, _data| async move {
            state.c += 0.5;
            Ok(state)
        })
        .on("bad", |_socket, _state, _data| async move {
            Err(anyhow!("boom"))
        })
}

#[tokio::test]
async fn click_produces_patch_then_ack() {
    let mut client = TestClient::connect(thermostat(), LiveConfig::default());

    // Baseline render: statics plus full dynamics.
    match client.recv().await {
        ServerFrame::Render { d } => {
            assert_eq!(
                d.statics,
                vec!["<div>", "</div><button live-click=\"up\">+</button>"]
            );
            assert_eq!(d.dynamics, vec![Dynamic::Text("19.5".into())]);
        }
        other => panic!("expected baseline render, got {other:?}"),
    }

    client.event("up", json!({}), "1").await;
    match client.recv().await {
        ServerFrame::Patch { d } => {
            assert_eq!(d.0.get(&0), Some(&PatchValue::Text("20.0".into())));
            assert_eq!(d.0.len(), 1);
        }
        other => panic!("expected patch, got {other:?}"),
    }
    assert_eq!(client.recv().await, ServerFrame::Ack { i: "1".into() });

    client.close().await;
}

#[tokio::test]
async fn unchanged_state_sends_no_patch_but_still_acks() {
    let view = thermostat().on("noop", |_socket, state: Thermostat, _data| async move {
        Ok(state)
    });
    let mut client = TestClient::connect(view, LiveConfig::default());
    client.recv().await; // baseline

    client.event("noop", json!({}), "5").await;
    // The ack arrives with no patch ahead of it.
    assert_eq!(client.recv().await, ServerFrame::Ack { i: "5".into() });

    client.close().await;
}

#[tokio::test]
async fn unknown_event_is_dropped_without_ack_or_close() {
    let mut client = TestClient::connect(thermostat(), LiveConfig::default());
    client.recv().await; // baseline

    client.event("nope", json!({}), "7").await;
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.try_recv(), None);
    assert!(!client.is_closed());

    // The connection still works afterward.
    client.event("up", json!({}), "8").await;
    assert!(matches!(client.recv().await, ServerFrame::Patch { .. }));

    client.close().await;
}

#[tokio::test]
async fn failing_handler_pushes_err_and_preserves_state() {
    let mut client = TestClient::connect(thermostat(), LiveConfig::default());
    client.recv().await; // baseline

    client.event("bad", json!({}), "3").await;
    match client.recv().await {
        ServerFrame::Push { d } => {
            assert_eq!(d.event, "err");
            assert_eq!(d.payload["id"], json!("3"));
            assert_eq!(d.payload["message"], json!("boom"));
        }
        other => panic!("expected err push, got {other:?}"),
    }
    // No patch and no ack follow a failed dispatch.
    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.try_recv(), None);

    // State is untouched: the next increment patches from the original value.
    client.event("up", json!({}), "4").await;
    match client.recv().await {
        ServerFrame::Patch { d } => {
            assert_eq!(d.0.get(&0), Some(&PatchValue::Text("20.0".into())));
        }
        other => panic!("expected patch, got {other:?}"),
    }

    client.close().await;
}

#[derive(Clone, Serialize)]
struct Paged {
    page: String,
}

#[tokio::test]
async fn params_event_routes_to_params_callback() {
    let template = Template::parse("<p>page {{.page}}</p>").unwrap();
    let view = LiveView::with_template(
        |_socket| async move { Ok(Paged { page: "1".into() }) },
        template,
    )
    .on_params(|_socket, mut state: Paged, data: EventData| async move {
        if let Some(page) = data.get("page").and_then(|v| v.as_str()) {
            state.page = page.to_string();
        }
        Ok(state)
    });

    let mut client = TestClient::connect(view, LiveConfig::default());
    client.recv().await; // baseline

    client.params(json!({ "page": "2" }), "9").await;
    match client.recv().await {
        ServerFrame::Patch { d } => {
            assert_eq!(d.0.get(&0), Some(&PatchValue::Text("2".into())));
        }
        other => panic!("expected patch, got {other:?}"),
    }
    assert_eq!(client.recv().await, ServerFrame::Ack { i: "9".into() });

    client.close().await;
}

#[derive(Clone, Serialize)]
struct Room {
    last: String,
}

fn room_view(bus: PubSub) -> LiveView<Room> {
    let template = Template::parse("<p>{{.last}}</p>").unwrap();
    LiveView::with_template(
        |socket| async move {
            socket.subscribe("room:1");
            Ok(Room {
                last: String::new(),
            })
        },
        template,
    )
    .on("room:1", |_socket, mut state: Room, data: EventData| async move {
        if let Some(text) = data.get("text").and_then(|v| v.as_str()) {
            state.last = text.to_string();
        }
        Ok(state)
    })
    .pubsub(bus)
}

#[tokio::test]
async fn broadcast_reaches_every_subscribed_socket_in_order() {
    let bus = PubSub::in_process();
    let mut a = TestClient::connect(room_view(bus.clone()), LiveConfig::default());
    let mut b = TestClient::connect(room_view(bus.clone()), LiveConfig::default());
    a.recv().await; // baselines
    b.recv().await;

    // A queue round-trip guarantees the mount-time subscriptions are
    // registered before anything is published.
    a.send(ClientFrame::Event {
        n: String::new(),
        d: EventData::new(),
        i: Some("sync".into()),
    })
    .await;
    assert_eq!(a.recv().await, ServerFrame::Ack { i: "sync".into() });
    b.send(ClientFrame::Event {
        n: String::new(),
        d: EventData::new(),
        i: Some("sync".into()),
    })
    .await;
    assert_eq!(b.recv().await, ServerFrame::Ack { i: "sync".into() });

    bus.publish("room:1", json!({ "text": "first" }));
    bus.publish("room:1", json!({ "text": "second" }));

    for client in [&mut a, &mut b] {
        match client.recv().await {
            ServerFrame::Patch { d } => {
                assert_eq!(d.0.get(&0), Some(&PatchValue::Text("first".into())));
            }
            other => panic!("expected first patch, got {other:?}"),
        }
        match client.recv().await {
            ServerFrame::Patch { d } => {
                assert_eq!(d.0.get(&0), Some(&PatchValue::Text("second".into())));
            }
            other => panic!("expected second patch, got {other:?}"),
        }
    }

    a.close().await;
    b.close().await;
}

#[derive(Clone, Serialize)]
struct Toggled {
    fancy: bool,
}

#[tokio::test]
async fn structural_change_sends_fresh_baseline_not_patch() {
    // A callback renderer whose statics depend on state: a structural
    // change the differ must not try to patch around.
    let view = LiveView::with_renderer(
        |_socket| async move { Ok(Toggled { fancy: false }) },
        |state: &Toggled| {
            let statics = if state.fancy {
                vec!["<li class=\"x\">".to_string(), "</li>".to_string()]
            } else {
                vec!["<li>".to_string(), "</li>".to_string()]
            };
            Ok(RenderTree::new(statics, vec![Dynamic::Text("item".into())]))
        },
    )
    .on("toggle", |_socket, mut state: Toggled, _data| async move {
        state.fancy = !state.fancy;
        Ok(state)
    });

    let mut client = TestClient::connect(view, LiveConfig::default());
    client.recv().await; // baseline

    client.event("toggle", json!({}), "2").await;
    match client.recv().await {
        ServerFrame::Render { d } => {
            assert_eq!(d.statics, vec!["<li class=\"x\">", "</li>"]);
        }
        other => panic!("expected full render, got {other:?}"),
    }
    assert_eq!(client.recv().await, ServerFrame::Ack { i: "2".into() });

    client.close().await;
}

#[derive(Clone, Serialize)]
struct Chained {
    n: i64,
}

#[tokio::test]
async fn self_events_are_processed_fifo_after_inbound() {
    let template = Template::parse("{{.n}}").unwrap();
    let view = LiveView::with_template(
        |_socket| async move { Ok(Chained { n: 0 }) },
        template,
    )
    .on("start", |socket, mut state: Chained, _data| async move {
        state.n += 1;
        socket.push_self("follow-up", json!({}));
        Ok(state)
    })
    .on("follow-up", |_socket, mut state: Chained, _data| async move {
        state.n += 10;
        Ok(state)
    });

    let mut client = TestClient::connect(view, LiveConfig::default());
    client.recv().await; // baseline

    client.event("start", json!({}), "1").await;
    match client.recv().await {
        ServerFrame::Patch { d } => assert_eq!(d.0.get(&0), Some(&PatchValue::Text("1".into()))),
        other => panic!("expected patch, got {other:?}"),
    }
    assert_eq!(client.recv().await, ServerFrame::Ack { i: "1".into() });
    match client.recv().await {
        ServerFrame::Patch { d } => assert_eq!(d.0.get(&0), Some(&PatchValue::Text("11".into()))),
        other => panic!("expected follow-up patch, got {other:?}"),
    }

    client.close().await;
}

#[tokio::test]
async fn patch_url_updates_client_between_patch_and_ack() {
    let view = thermostat().on("go", |socket, state: Thermostat, _data| async move {
        socket.patch_url("/?page=2");
        Ok(Thermostat { c: state.c + 0.5 })
    });
    let mut client = TestClient::connect(view, LiveConfig::default());
    client.recv().await; // baseline

    client.event("go", json!({}), "6").await;
    assert!(matches!(client.recv().await, ServerFrame::Patch { .. }));
    match client.recv().await {
        ServerFrame::Push { d } => {
            assert_eq!(d.event, "pushstate");
            assert_eq!(d.payload["url"], json!("/?page=2"));
        }
        other => panic!("expected pushstate push, got {other:?}"),
    }
    assert_eq!(client.recv().await, ServerFrame::Ack { i: "6".into() });

    client.close().await;
}

#[derive(Clone, Serialize)]
struct Who {
    user: String,
}

#[tokio::test]
async fn session_data_set_at_mount_is_visible_to_handlers() {
    let template = Template::parse("{{.user}}").unwrap();
    let view = LiveView::with_template(
        |socket| async move {
            socket.set_session_data("user", json!("ada"));
            Ok(Who {
                user: String::new(),
            })
        },
        template,
    )
    .on("who", |socket, mut state: Who, _data| async move {
        state.user = socket
            .session()
            .data
            .get("user")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(state)
    });

    let mut client = TestClient::connect(view, LiveConfig::default());
    client.recv().await; // baseline

    client.event("who", json!({}), "1").await;
    match client.recv().await {
        ServerFrame::Patch { d } => {
            assert_eq!(d.0.get(&0), Some(&PatchValue::Text("ada".into())));
        }
        other => panic!("expected patch, got {other:?}"),
    }
    assert_eq!(client.recv().await, ServerFrame::Ack { i: "1".into() });

    client.close().await;
}

#[tokio::test]
async fn idle_socket_closes_and_runs_disconnect_lifecycle() {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = disconnects.clone();
    let view = thermostat().on_disconnect(move |_socket, state: Thermostat, _data| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(state)
        }
    });

    let config = LiveConfig {
        idle_timeout: Duration::from_millis(50),
        ..LiveConfig::default()
    };
    let mut client = TestClient::connect(view, config);
    client.recv().await; // baseline

    time::sleep(Duration::from_millis(300)).await;
    assert!(client.is_closed());
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    client.close().await;
}
