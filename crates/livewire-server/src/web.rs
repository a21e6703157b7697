//! HTTP and WebSocket handlers for serving live views with Axum.
//!
//! One route serves both phases of a view's lifecycle: a plain GET returns
//! the initial HTML with the session cookie and bootstrap payload, and a
//! WebSocket upgrade on the same URL starts the live session. The embedded
//! client bundle is served at `/live.js`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{header, HeaderMap, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use livewire_core::protocol::ServerFrame;

use crate::error::LiveError;
use crate::session::{Session, SessionStore};
use crate::socket::{run_socket, Effect, Incoming, Socket};
use crate::view::LiveView;
use crate::LiveConfig;
use livewire_core::protocol::ClientFrame;
use livewire_core::tree::RenderTree;

/// The embedded browser client, served at `/live.js`.
const LIVE_JS: &str = include_str!("live.js");

/// Serves one [`LiveView`] over HTTP and WebSocket.
pub struct LiveHandler<S> {
    view: Arc<LiveView<S>>,
    store: Arc<SessionStore>,
    config: Arc<LiveConfig>,
}

impl<S> Clone for LiveHandler<S> {
    fn clone(&self) -> Self {
        Self {
            view: self.view.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S> LiveHandler<S>
where
    S: Clone + Serialize + Send + Sync + 'static,
{
    /// Wraps a view with its serving configuration.
    pub fn new(view: LiveView<S>, config: LiveConfig) -> Self {
        let store = SessionStore::new(config.session_key.clone(), config.session_cookie.clone());
        Self {
            view: Arc::new(view),
            store: Arc::new(store),
            config: Arc::new(config),
        }
    }

    /// Returns a router serving the view at `path` plus the client bundle
    /// at `/live.js`.
    pub fn router(self, path: &str) -> Router {
        Router::new()
            .route(path, any(serve::<S>))
            .route("/live.js", get(client_bundle))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Initial HTTP render: mount against a pre-upgrade socket, render, and
    /// reply with the page, bootstrap payload, and session cookie.
    async fn page(&self, headers: HeaderMap, uri: Uri) -> Response {
        let mut session = self.store.load(&headers);
        let (socket, mut effects) = Socket::pre_upgrade(session.clone(), uri.to_string());
        let assigns = match (self.view.mount)(socket).await {
            Ok(assigns) => assigns,
            Err(err) => return (self.view.error_handler)(&LiveError::Mount(err)),
        };
        // Session data is set at mount time; fold it into the session before
        // the cookie is sealed. Other effects need a live connection.
        while let Ok(effect) = effects.try_recv() {
            if let Effect::SetSessionData { key, value } = effect {
                session.data.insert(key, value);
            }
        }
        let tree = match self.render_initial(&assigns) {
            Ok(tree) => tree,
            Err(err) => return (self.view.error_handler)(&LiveError::Render(err)),
        };
        let cookie = match self.store.cookie(&session) {
            Ok(cookie) => cookie,
            Err(err) => return (self.view.error_handler)(&err),
        };
        let html = page_html(&session.id, &tree);
        ([(header::SET_COOKIE, cookie)], Html(html)).into_response()
    }

    fn render_initial(&self, assigns: &S) -> anyhow::Result<RenderTree> {
        let mut subtrees = std::collections::HashMap::new();
        let mut states = std::collections::HashMap::new();
        for (id, component) in &self.view.components {
            let state = component.initial_state();
            subtrees.insert(id.clone(), component.render(&state)?);
            states.insert(id.clone(), state);
        }
        self.view.renderer.render(assigns, &subtrees, &states)
    }

    /// WebSocket upgrade: the session cookie must verify; nothing from the
    /// HTTP render is reused.
    fn upgrade(&self, ws: WebSocketUpgrade, headers: HeaderMap, uri: Uri) -> Response {
        let Some(session) = self.store.find(&headers) else {
            let err = LiveError::Handshake("missing or invalid session cookie".into());
            return (self.view.error_handler)(&err);
        };
        let handler = self.clone();
        let url = uri.to_string();
        ws.on_upgrade(move |socket| async move {
            handler.run_connection(socket, session, url).await;
        })
    }

    /// Bridges the WebSocket to the socket's serialized event loop.
    async fn run_connection(&self, socket: WebSocket, session: Session, url: String) {
        let (mut sender, receiver) = socket.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_queue);
        let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(self.config.outbound_queue);
        let cancel = CancellationToken::new();
        let slow_client = Arc::new(AtomicBool::new(false));

        // Writer task: drains the bounded outbound queue onto the wire.
        let send_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sender.send(Message::Text(frame.encode().into())).await.is_err() {
                    return;
                }
            }
            let _ = sender.send(Message::Close(None)).await;
        });

        // Reader task: decodes frames into the bounded inbound queue.
        let recv_task = tokio::spawn(read_frames(
            receiver,
            inbound_tx.clone(),
            cancel.clone(),
            slow_client.clone(),
            self.config.protocol_error_limit,
        ));

        // This task is the socket's serialized executor.
        run_socket(
            self.view.clone(),
            self.config.clone(),
            session,
            url,
            inbound_tx,
            inbound_rx,
            out_tx,
            cancel,
            slow_client,
        )
        .await;

        let _ = recv_task.await;
        let _ = send_task.await;
        debug!("live connection finished");
    }
}

/// Reads wire messages into the bounded inbound queue, enforcing the
/// protocol-error and backpressure policies.
///
/// On inbound overflow the slow-client flag is raised before cancelling so
/// the event loop tears down with the slow-client reason. Undecodable
/// frames are dropped, but more than `limit` of them closes the connection.
async fn read_frames<R>(
    mut receiver: R,
    tx: mpsc::Sender<Incoming>,
    cancel: CancellationToken,
    slow_client: Arc<AtomicBool>,
    limit: u32,
) where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut protocol_errors = 0;
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = receiver.next() => message,
        };
        let Some(Ok(message)) = message else { break };
        let Message::Text(text) = message else { continue };
        match ClientFrame::decode(&text) {
            Ok(frame) => match tx.try_send(Incoming::Frame(frame)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("inbound queue overflow, closing slow client");
                    slow_client.store(true, Ordering::Relaxed);
                    break;
                }
                Err(TrySendError::Closed(_)) => break,
            },
            Err(err) => {
                // Dropped, not fatal; but repeated garbage closes.
                protocol_errors += 1;
                warn!(?err, "dropping undecodable frame");
                if protocol_errors > limit {
                    warn!("too many protocol errors, closing");
                    break;
                }
            }
        }
    }
    cancel.cancel();
}

/// Shared entry point: a WebSocket upgrade starts a live session, any other
/// GET performs the initial render.
async fn serve<S>(State(handler): State<LiveHandler<S>>, request: Request) -> Response
where
    S: Clone + Serialize + Send + Sync + 'static,
{
    let (mut parts, _body) = request.into_parts();
    let headers = parts.headers.clone();
    let uri = parts.uri.clone();
    if is_upgrade(&headers) {
        match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => handler.upgrade(ws, headers, uri),
            Err(rejection) => rejection.into_response(),
        }
    } else {
        handler.page(headers, uri).await
    }
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

async fn client_bundle() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/javascript; charset=utf-8")],
        LIVE_JS,
    )
}

/// Builds the initial HTML document: rendered view, bootstrap payload, and
/// the client script tag.
fn page_html(session_id: &str, tree: &RenderTree) -> String {
    let mut bootstrap = serde_json::to_value(tree).expect("render tree serializes");
    bootstrap["sid"] = json!(session_id);
    // `</` must not terminate the script element early.
    let bootstrap = bootstrap.to_string().replace("</", "<\\/");
    format!(
        "<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <script defer src=\"/live.js\"></script>\n</head>\n<body>\n\
         <div live-root>{}</div>\n\
         <script type=\"application/json\" id=\"live-bootstrap\">{}</script>\n\
         </body>\n</html>\n",
        tree.to_html(),
        bootstrap,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use livewire_core::template::Template;
    use livewire_core::tree::Dynamic;

    #[derive(Clone, Serialize)]
    struct Empty {}

    #[tokio::test]
    async fn reader_overflow_flags_slow_client_and_stops() {
        let frames: Vec<Result<Message, axum::Error>> = vec![
            Ok(Message::Text(r#"{"t":"event","n":"a"}"#.into())),
            Ok(Message::Text(r#"{"t":"event","n":"b"}"#.into())),
        ];
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let slow_client = Arc::new(AtomicBool::new(false));
        read_frames(stream::iter(frames), tx, cancel.clone(), slow_client.clone(), 8).await;

        assert!(slow_client.load(Ordering::Relaxed));
        assert!(cancel.is_cancelled());
        // Only the first frame fit in the queue; the reader stopped on the
        // second instead of dropping it silently.
        assert!(matches!(rx.try_recv(), Ok(Incoming::Frame(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn repeated_protocol_garbage_stops_the_reader() {
        let mut frames: Vec<Result<Message, axum::Error>> = (0..4)
            .map(|_| Ok(Message::Text("not json".into())))
            .collect();
        frames.push(Ok(Message::Text(r#"{"t":"event","n":"late"}"#.into())));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let slow_client = Arc::new(AtomicBool::new(false));
        read_frames(stream::iter(frames), tx, cancel.clone(), slow_client.clone(), 2).await;

        // Garbage is a protocol error, not backpressure.
        assert!(!slow_client.load(Ordering::Relaxed));
        assert!(cancel.is_cancelled());
        // The reader gave up before reaching the valid frame.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn isolated_garbage_is_dropped_but_frames_still_flow() {
        let frames: Vec<Result<Message, axum::Error>> = vec![
            Ok(Message::Text("not json".into())),
            Ok(Message::Text(r#"{"t":"event","n":"a"}"#.into())),
        ];
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let slow_client = Arc::new(AtomicBool::new(false));
        read_frames(stream::iter(frames), tx, cancel.clone(), slow_client, 8).await;

        assert!(matches!(rx.try_recv(), Ok(Incoming::Frame(_))));
    }

    #[tokio::test]
    async fn mount_session_data_is_sealed_into_the_cookie() {
        let view = LiveView::with_template(
            |socket: Socket| async move {
                socket.set_session_data("user", json!("ada"));
                Ok(Empty {})
            },
            Template::parse("hi").unwrap(),
        );
        let config = LiveConfig::default();
        let key = config.session_key.clone();
        let handler = LiveHandler::new(view, config);

        let response = handler.page(HeaderMap::new(), Uri::from_static("/")).await;
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .expect("page sets the session cookie")
            .to_str()
            .unwrap();
        let sealed = cookie
            .strip_prefix("live-session=")
            .unwrap()
            .split(';')
            .next()
            .unwrap();

        let store = SessionStore::new(key, "live-session");
        let session = store.decode(sealed).expect("cookie verifies");
        assert_eq!(session.data.get("user"), Some(&json!("ada")));
    }

    #[test]
    fn page_embeds_bootstrap_and_client_script() {
        let tree = RenderTree::new(
            vec!["<div>".into(), "</div>".into()],
            vec![Dynamic::Text("19.5".into())],
        );
        let html = page_html("abc123", &tree);
        assert!(html.contains("<div live-root><div>19.5</div></div>"));
        assert!(html.contains("src=\"/live.js\""));
        assert!(html.contains("\"sid\":\"abc123\""));
        // Closing tags inside the payload cannot break out of the script.
        assert!(html.contains("<\\/div>"));
    }

    #[test]
    fn upgrade_detection_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade(&headers));
        headers.insert(header::UPGRADE, "WebSocket".parse().unwrap());
        assert!(is_upgrade(&headers));
    }
}
