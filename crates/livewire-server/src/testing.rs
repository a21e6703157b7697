//! In-memory harness for exercising live views without a network socket.
//!
//! [`TestClient`] stands in for the browser: it connects a view's event
//! loop to channel endpoints, so tests send [`ClientFrame`]s and observe
//! the exact [`ServerFrame`]s a real client would receive, in order.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::session::Session;
use crate::socket::{run_socket, Incoming};
use crate::view::LiveView;
use crate::LiveConfig;
use livewire_core::protocol::{ClientFrame, EventData, ServerFrame};

/// How long [`TestClient::recv`] waits before giving up.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A simulated browser connection to one live view.
pub struct TestClient {
    inbound_tx: mpsc::Sender<Incoming>,
    out_rx: mpsc::Receiver<ServerFrame>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TestClient {
    /// Connects to a view with a fresh session, consuming the upgrade path
    /// up to (but not including) the baseline `render` frame.
    pub fn connect<S>(view: LiveView<S>, config: LiveConfig) -> Self
    where
        S: Clone + Serialize + Send + Sync + 'static,
    {
        Self::connect_with(view, config, Session::generate())
    }

    /// Connects with an explicit session, e.g. to preset session data.
    pub fn connect_with<S>(view: LiveView<S>, config: LiveConfig, session: Session) -> Self
    where
        S: Clone + Serialize + Send + Sync + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue);
        let (out_tx, out_rx) = mpsc::channel(config.outbound_queue);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_socket(
            Arc::new(view),
            Arc::new(config),
            session,
            "/".to_string(),
            inbound_tx.clone(),
            inbound_rx,
            out_tx,
            cancel.clone(),
            Arc::new(AtomicBool::new(false)),
        ));
        Self {
            inbound_tx,
            out_rx,
            cancel,
            task,
        }
    }

    /// Sends a raw frame, as if decoded off the wire.
    pub async fn send(&self, frame: ClientFrame) {
        self.inbound_tx
            .send(Incoming::Frame(frame))
            .await
            .expect("live socket is gone");
    }

    /// Sends an application event with a correlation id.
    pub async fn event(&self, name: &str, data: Value, id: &str) {
        self.send(ClientFrame::Event {
            n: name.to_string(),
            d: as_event_data(data),
            i: Some(id.to_string()),
        })
        .await;
    }

    /// Sends a `params` frame carrying new query parameters.
    pub async fn params(&self, data: Value, id: &str) {
        self.send(ClientFrame::Params {
            d: as_event_data(data),
            i: Some(id.to_string()),
        })
        .await;
    }

    /// Receives the next server frame, panicking after a timeout.
    pub async fn recv(&mut self) -> ServerFrame {
        time::timeout(RECV_TIMEOUT, self.out_rx.recv())
            .await
            .expect("timed out waiting for a server frame")
            .expect("live socket closed")
    }

    /// Returns a frame only if one is already queued.
    pub fn try_recv(&mut self) -> Option<ServerFrame> {
        self.out_rx.try_recv().ok()
    }

    /// True once the server has closed its side.
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    /// Disconnects, waiting for the socket task to finish.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

fn as_event_data(data: Value) -> EventData {
    match data {
        Value::Object(map) => map,
        Value::Null => EventData::new(),
        other => {
            let mut map = EventData::new();
            map.insert("payload".into(), other);
            map
        }
    }
}
