//! Per-connection state and the serialized event loop that drives it.
//!
//! Each live browser connection gets one [`Socket`] and one loop task. The
//! loop owns the authoritative state (assigns, the last render tree, the
//! URL) and is the only place that mutates it, so no locks are involved.
//! Callbacks receive a cheap [`Socket`] handle whose operations enqueue
//! side effects; the loop applies them in submission order after the
//! callback returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::session::Session;
use crate::view::{EventFn, LiveView};
use crate::LiveConfig;
use livewire_core::protocol::{
    ClientFrame, ErrPayload, EventData, PushPayload, RedirectPayload, ServerFrame, EVENT_ERR,
    EVENT_PUSHSTATE,
};
use livewire_core::tree::{diff, Diff, RenderTree};

/// Handle to one live browser connection, passed to every callback.
///
/// Cloning is cheap. All mutating operations enqueue effects that the
/// connection's event loop applies in submission order once the current
/// callback returns; none of them block.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    session: Session,
    url: String,
    connected: bool,
    effects: mpsc::UnboundedSender<Effect>,
    cancel: CancellationToken,
}

impl Socket {
    pub(crate) fn new(
        session: Session,
        url: String,
        connected: bool,
        effects: mpsc::UnboundedSender<Effect>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                session,
                url,
                connected,
                effects,
                cancel,
            }),
        }
    }

    /// Builds the socket used for the initial HTTP render, before any live
    /// connection exists. The HTTP entry drains the returned receiver to
    /// pick up session-data writes from mount; every other effect needs a
    /// live connection and is dropped.
    pub(crate) fn pre_upgrade(
        session: Session,
        url: String,
    ) -> (Self, mpsc::UnboundedReceiver<Effect>) {
        let (effects, rx) = mpsc::unbounded_channel();
        let socket = Self::new(session, url, false, effects, CancellationToken::new());
        (socket, rx)
    }

    /// The opaque session identifier.
    pub fn id(&self) -> &str {
        &self.inner.session.id
    }

    /// The session, including application data set at mount time.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// The current browser URL as seen by the server.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// False during the initial HTTP render, true during the live session.
    pub fn connected(&self) -> bool {
        self.inner.connected
    }

    /// Cancelled when the socket closes; long handlers should watch it.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Updates the URL and instructs the client to `pushState` to it.
    pub fn patch_url(&self, url: impl Into<String>) {
        self.effect(Effect::PatchUrl(url.into()));
    }

    /// Navigates the client away from the view.
    pub fn redirect(&self, url: impl Into<String>) {
        self.effect(Effect::Redirect(url.into()));
    }

    /// Enqueues an event to be processed as if received from the client,
    /// in FIFO order with inbound frames.
    pub fn push_self(&self, event: impl Into<String>, payload: Value) {
        self.effect(Effect::SelfEvent {
            name: event.into(),
            payload,
        });
    }

    /// Pushes an event to client-side hooks.
    pub fn push_event(&self, event: impl Into<String>, payload: Value) {
        self.effect(Effect::Push {
            event: event.into(),
            payload,
        });
    }

    /// Publishes a payload on the view's pub/sub bus.
    pub fn broadcast(&self, topic: impl Into<String>, payload: Value) {
        self.effect(Effect::Broadcast {
            topic: topic.into(),
            payload,
        });
    }

    /// Subscribes this socket to a topic; deliveries enter its event queue.
    pub fn subscribe(&self, topic: impl Into<String>) {
        self.effect(Effect::Subscribe(topic.into()));
    }

    /// Writes one entry of the session's application data map.
    ///
    /// The cookie is sealed only during the initial HTTP response, so writes
    /// made by mount on the pre-upgrade socket persist in the browser;
    /// writes on a live socket update the in-memory session seen by later
    /// callbacks.
    pub fn set_session_data(&self, key: impl Into<String>, value: Value) {
        self.effect(Effect::SetSessionData {
            key: key.into(),
            value,
        });
    }

    fn effect(&self, effect: Effect) {
        // The loop owns the receiver; a closed socket drops effects.
        let _ = self.inner.effects.send(effect);
    }
}

/// A side effect enqueued by a [`Socket`] operation.
pub(crate) enum Effect {
    PatchUrl(String),
    Redirect(String),
    SelfEvent { name: String, payload: Value },
    Push { event: String, payload: Value },
    Broadcast { topic: String, payload: Value },
    Subscribe(String),
    SetSessionData { key: String, value: Value },
}

/// One unit of work for a socket's event loop.
pub(crate) enum Incoming {
    /// A decoded frame from the client.
    Frame(ClientFrame),
    /// A self-enqueued event from `Socket::push_self`.
    SelfEvent { name: String, payload: Value },
    /// A pub/sub delivery for a subscribed topic.
    Broadcast { topic: String, payload: Value },
}

/// Why the loop stopped, for the close log line.
enum Close {
    Transport,
    Idle,
    SlowClient,
    Cancelled,
    Failed,
}

/// What to restore when a render fails after a successful dispatch.
enum Revert<S> {
    Assigns(S),
    Component(String, Value),
}

/// Runs the serialized event loop for one live connection.
///
/// Consumes `inbound_rx`; `inbound_tx` feeds the same queue from self
/// events and pub/sub forwarders. Outbound frames go through the bounded
/// `out_tx`, which provides cooperative backpressure: the loop parks while
/// the writer drains, and closes the socket as a slow client if draining
/// exceeds the configured write timeout. The reader task sets `slow_client`
/// before cancelling when the inbound queue overflows, so that teardown is
/// reported with the slow-client reason rather than as a plain cancel.
pub(crate) async fn run_socket<S>(
    view: Arc<LiveView<S>>,
    config: Arc<LiveConfig>,
    session: Session,
    url: String,
    inbound_tx: mpsc::Sender<Incoming>,
    inbound_rx: mpsc::Receiver<Incoming>,
    out_tx: mpsc::Sender<ServerFrame>,
    cancel: CancellationToken,
    slow_client: Arc<AtomicBool>,
) where
    S: Clone + Serialize + Send + Sync + 'static,
{
    let (effects_tx, effects_rx) = mpsc::unbounded_channel();
    let socket = Socket::new(
        session.clone(),
        url.clone(),
        true,
        effects_tx.clone(),
        cancel.clone(),
    );

    // Mount is re-invoked on upgrade; nothing is reused from the HTTP render.
    let assigns = match (view.mount)(socket).await {
        Ok(assigns) => assigns,
        Err(err) => {
            error!(?err, "mount failed during upgrade");
            let frame = ServerFrame::Err {
                d: ErrPayload {
                    id: None,
                    message: "mount failed".into(),
                },
            };
            let _ = time::timeout(config.write_timeout, out_tx.send(frame)).await;
            cancel.cancel();
            return;
        }
    };

    let component_states = view
        .components
        .iter()
        .map(|(id, c)| (id.clone(), c.initial_state()))
        .collect();

    let driver = Driver {
        view,
        config,
        session,
        url,
        assigns,
        last_render: RenderTree::empty(),
        component_states,
        effects_tx,
        effects_rx,
        inbound_tx,
        out_tx,
        cancel,
        slow_client,
    };
    driver.run(inbound_rx).await;
}

struct Driver<S> {
    view: Arc<LiveView<S>>,
    config: Arc<LiveConfig>,
    session: Session,
    url: String,
    assigns: S,
    last_render: RenderTree,
    component_states: HashMap<String, Value>,
    effects_tx: mpsc::UnboundedSender<Effect>,
    effects_rx: mpsc::UnboundedReceiver<Effect>,
    inbound_tx: mpsc::Sender<Incoming>,
    out_tx: mpsc::Sender<ServerFrame>,
    cancel: CancellationToken,
    slow_client: Arc<AtomicBool>,
}

impl<S> Driver<S>
where
    S: Clone + Serialize + Send + Sync + 'static,
{
    async fn run(mut self, mut inbound_rx: mpsc::Receiver<Incoming>) {
        let close = self.session_loop(&mut inbound_rx).await;

        // A slow-client close carries its reason to the client, best effort:
        // the writer may still drain even when the inbound side fell behind.
        if matches!(close, Close::SlowClient) {
            let frame = ServerFrame::Err {
                d: ErrPayload {
                    id: None,
                    message: "slow client".into(),
                },
            };
            let _ = self.out_tx.try_send(frame);
        }

        // Disconnect lifecycle runs on every teardown path after a
        // successful baseline, including idle timeout and transport loss.
        if let Some(handler) = self.view.disconnect.clone() {
            if let Err(err) = handler(self.socket(), self.assigns.clone(), EventData::new()).await {
                warn!(?err, "disconnect callback failed");
            }
        }
        self.cancel.cancel();

        match close {
            Close::Transport => debug!(session = %self.session.id, "live socket closed by peer"),
            Close::Idle => info!(session = %self.session.id, "closing idle live socket"),
            Close::SlowClient => warn!(session = %self.session.id, "closing slow client"),
            Close::Cancelled => debug!(session = %self.session.id, "live socket cancelled"),
            Close::Failed => {}
        }
    }

    async fn session_loop(&mut self, inbound_rx: &mut mpsc::Receiver<Incoming>) -> Close {
        // Baseline render: statics plus full dynamics.
        match self.render() {
            Ok(tree) => {
                if !self.send(ServerFrame::Render { d: tree.clone() }).await {
                    return Close::SlowClient;
                }
                self.last_render = tree;
            }
            Err(err) => {
                error!(?err, "baseline render failed");
                let frame = ServerFrame::Err {
                    d: ErrPayload {
                        id: None,
                        message: "render failed".into(),
                    },
                };
                let _ = self.send(frame).await;
                return Close::Failed;
            }
        }

        // Mount may have subscribed to topics or queued self events.
        match self.drain_effects() {
            Ok(frames) => {
                if !self.send_all(frames).await {
                    return Close::SlowClient;
                }
            }
            Err(()) => return Close::SlowClient,
        }

        if let Some(handler) = self.view.connect.clone() {
            if !self.invoke(handler, EventData::new(), None).await {
                return Close::SlowClient;
            }
        }

        let mut deadline = Instant::now() + self.config.idle_timeout;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // The reader flags inbound overflow before cancelling.
                    return if self.slow_client.load(Ordering::Relaxed) {
                        Close::SlowClient
                    } else {
                        Close::Cancelled
                    };
                }
                _ = time::sleep_until(deadline) => return Close::Idle,
                effect = self.effects_rx.recv() => {
                    // Effects sent from tasks a handler spawned, arriving
                    // between dispatches.
                    let Some(effect) = effect else { return Close::Cancelled };
                    let mut frames = Vec::new();
                    if !self.apply_effect(effect, &mut frames) || !self.send_all(frames).await {
                        return Close::SlowClient;
                    }
                }
                incoming = inbound_rx.recv() => {
                    let Some(incoming) = incoming else { return Close::Transport };
                    deadline = Instant::now() + self.config.idle_timeout;
                    if !self.handle(incoming).await {
                        return Close::SlowClient;
                    }
                }
            }
        }
    }

    /// Processes one queue entry. Returns false when the socket must close.
    async fn handle(&mut self, incoming: Incoming) -> bool {
        match incoming {
            Incoming::Frame(ClientFrame::Event { n, d, i }) => {
                if n.is_empty() {
                    return self.ack(i).await;
                }
                self.dispatch(&n, d, i).await
            }
            Incoming::Frame(ClientFrame::Hook { n, d, i }) => {
                // An empty hook name is the mount ping.
                if n.is_empty() {
                    return self.ack(i).await;
                }
                self.dispatch(&n, d, i).await
            }
            Incoming::Frame(ClientFrame::Params { d, i }) => match self.view.params.clone() {
                Some(handler) => self.invoke(handler, d, i).await,
                None => {
                    debug!("params event with no params callback");
                    true
                }
            },
            Incoming::SelfEvent { name, payload } => {
                let data = into_event_data(payload);
                self.dispatch(&name, data, None).await
            }
            Incoming::Broadcast { topic, payload } => {
                let data = into_event_data(payload);
                self.dispatch(&topic, data, None).await
            }
        }
    }

    /// Routes an event name to its callback. Unknown names are dropped with
    /// a warning, never a close: clients can race template updates.
    async fn dispatch(&mut self, name: &str, data: EventData, id: Option<String>) -> bool {
        if let Some((comp_id, event)) = name.split_once(':') {
            if self.view.components.contains_key(comp_id) {
                return self.dispatch_component(comp_id.to_string(), event.to_string(), data, id)
                    .await;
            }
        }
        let Some(handler) = self.view.events.get(name).cloned() else {
            warn!(%name, "no callback registered for event");
            return true;
        };
        self.invoke(handler, data, id).await
    }

    /// Runs one event callback and the render/diff/patch/ack tail.
    async fn invoke(&mut self, handler: EventFn<S>, data: EventData, id: Option<String>) -> bool {
        let fut = handler(self.socket(), self.assigns.clone(), data);
        let result = match self.config.handler_timeout {
            Some(limit) => match time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("callback deadline exceeded")),
            },
            None => fut.await,
        };
        match result {
            Ok(new) => {
                let prev = std::mem::replace(&mut self.assigns, new);
                self.after_dispatch(Revert::Assigns(prev), id).await
            }
            Err(err) => {
                warn!(?err, "event callback failed");
                self.push_err(id, &err).await
            }
        }
    }

    async fn dispatch_component(
        &mut self,
        comp_id: String,
        event: String,
        data: EventData,
        id: Option<String>,
    ) -> bool {
        let component = &self.view.components[&comp_id];
        let Some(handler) = component.handler(&event).cloned() else {
            warn!(component = %comp_id, %event, "no component callback registered");
            return true;
        };
        let state = self
            .component_states
            .get(&comp_id)
            .cloned()
            .unwrap_or(Value::Null);
        match handler(self.socket(), state, data).await {
            Ok(new) => {
                let prev = self
                    .component_states
                    .insert(comp_id.clone(), new)
                    .unwrap_or(Value::Null);
                self.after_dispatch(Revert::Component(comp_id, prev), id).await
            }
            Err(err) => {
                warn!(component = %comp_id, ?err, "component callback failed");
                self.push_err(id, &err).await
            }
        }
    }

    /// Applies queued effects, re-renders, sends the patch, then the ack.
    async fn after_dispatch(&mut self, revert: Revert<S>, id: Option<String>) -> bool {
        let frames = match self.drain_effects() {
            Ok(frames) => frames,
            Err(()) => return false,
        };
        match self.render() {
            Ok(next) => {
                match diff(&self.last_render, &next) {
                    Diff::Patch(patch) if patch.is_empty() => {}
                    Diff::Patch(patch) => {
                        if !self.send(ServerFrame::Patch { d: patch }).await {
                            return false;
                        }
                    }
                    Diff::Reset(tree) => {
                        if !self.send(ServerFrame::Render { d: tree }).await {
                            return false;
                        }
                    }
                }
                self.last_render = next;
            }
            Err(err) => {
                // Roll back so state and the client's view stay consistent.
                error!(?err, "render failed after dispatch");
                match revert {
                    Revert::Assigns(prev) => self.assigns = prev,
                    Revert::Component(comp_id, prev) => {
                        self.component_states.insert(comp_id, prev);
                    }
                }
                return self.push_err(id, &err).await;
            }
        }
        if !self.send_all(frames).await {
            return false;
        }
        self.ack(id).await
    }

    fn render(&self) -> anyhow::Result<RenderTree> {
        let mut subtrees = HashMap::new();
        for (id, component) in &self.view.components {
            let state = self
                .component_states
                .get(id)
                .cloned()
                .unwrap_or(Value::Null);
            subtrees.insert(id.clone(), component.render(&state)?);
        }
        self.view
            .renderer
            .render(&self.assigns, &subtrees, &self.component_states)
    }

    /// Applies every queued effect, collecting client-bound frames.
    fn drain_effects(&mut self) -> Result<Vec<ServerFrame>, ()> {
        let mut frames = Vec::new();
        while let Ok(effect) = self.effects_rx.try_recv() {
            if !self.apply_effect(effect, &mut frames) {
                return Err(());
            }
        }
        Ok(frames)
    }

    fn apply_effect(&mut self, effect: Effect, frames: &mut Vec<ServerFrame>) -> bool {
        match effect {
            Effect::PatchUrl(url) => {
                self.url.clone_from(&url);
                frames.push(ServerFrame::Push {
                    d: PushPayload {
                        event: EVENT_PUSHSTATE.into(),
                        payload: json!({ "url": url }),
                    },
                });
            }
            Effect::Redirect(url) => frames.push(ServerFrame::Redirect {
                d: RedirectPayload { url },
            }),
            Effect::Push { event, payload } => frames.push(ServerFrame::Push {
                d: PushPayload { event, payload },
            }),
            Effect::SelfEvent { name, payload } => {
                match self.inbound_tx.try_send(Incoming::SelfEvent { name, payload }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("inbound queue overflow on self event");
                        return false;
                    }
                    Err(TrySendError::Closed(_)) => return false,
                }
            }
            Effect::Broadcast { topic, payload } => self.view.pubsub.publish(&topic, payload),
            Effect::Subscribe(topic) => self.spawn_subscription(topic),
            Effect::SetSessionData { key, value } => {
                // Live-phase writes update the in-memory session only; the
                // cookie was sealed by the initial HTTP response.
                self.session.data.insert(key, value);
            }
        }
        true
    }

    /// Forwards deliveries for one topic into the socket's event queue.
    fn spawn_subscription(&self, topic: String) {
        let mut rx = self.view.pubsub.subscribe(&topic);
        let inbound = self.inbound_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    delivery = rx.recv() => {
                        let Some(payload) = delivery else { break };
                        let incoming = Incoming::Broadcast {
                            topic: topic.clone(),
                            payload,
                        };
                        if inbound.send(incoming).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn socket(&self) -> Socket {
        Socket::new(
            self.session.clone(),
            self.url.clone(),
            true,
            self.effects_tx.clone(),
            self.cancel.clone(),
        )
    }

    async fn push_err(&mut self, id: Option<String>, err: &anyhow::Error) -> bool {
        let mut payload = serde_json::Map::new();
        if let Some(id) = id {
            payload.insert("id".into(), Value::String(id));
        }
        payload.insert("message".into(), Value::String(err.to_string()));
        self.send(ServerFrame::Push {
            d: PushPayload {
                event: EVENT_ERR.into(),
                payload: Value::Object(payload),
            },
        })
        .await
    }

    async fn ack(&mut self, id: Option<String>) -> bool {
        match id {
            Some(i) => self.send(ServerFrame::Ack { i }).await,
            None => true,
        }
    }

    async fn send_all(&mut self, frames: Vec<ServerFrame>) -> bool {
        for frame in frames {
            if !self.send(frame).await {
                return false;
            }
        }
        true
    }

    /// Sends one frame, parking while the writer drains. A drain that
    /// exceeds the write timeout closes the socket as a slow client.
    async fn send(&self, frame: ServerFrame) -> bool {
        match time::timeout(self.config.write_timeout, self.out_tx.send(frame)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!("outbound queue failed to drain in time");
                false
            }
        }
    }
}

fn into_event_data(payload: Value) -> EventData {
    match payload {
        Value::Object(map) => map,
        other => {
            let mut map = EventData::new();
            map.insert("payload".into(), other);
            map
        }
    }
}
