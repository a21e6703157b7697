//! Server-driven live views over a persistent socket.
//!
//! The server owns authoritative per-session state ("assigns"), renders HTML
//! from it, and after each event streams a minimal patch to the browser. A
//! view is a [`LiveView`]: a mount callback, a renderer, and a table of event
//! callbacks. [`LiveHandler`] serves it over HTTP and WebSocket with Axum.
//!
//! ```no_run
//! use livewire_core::Template;
//! use livewire_server::{LiveConfig, LiveHandler, LiveView};
//! use serde::Serialize;
//!
//! #[derive(Clone, Serialize)]
//! struct Thermostat {
//!     c: f64,
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let template = Template::parse("<div>{{.c}}</div><button live-click=\"up\">+</button>")?;
//! let view = LiveView::with_template(|_socket| async move { Ok(Thermostat { c: 19.5 }) }, template)
//!     .on("up", |_socket, mut state: Thermostat, _data| async move {
//!         state.c += 0.5;
//!         Ok(state)
//!     });
//! let app = LiveHandler::new(view, LiveConfig::default()).router("/");
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

pub mod component;
pub mod error;
pub mod pubsub;
pub mod session;
pub mod socket;
pub mod testing;
pub mod view;
pub mod web;

// Re-export commonly used types.
pub use component::Component;
pub use error::LiveError;
pub use pubsub::{LocalBus, PubSub, PubSubBackend};
pub use session::{Session, SessionStore};
pub use socket::Socket;
pub use view::LiveView;
pub use web::LiveHandler;

use livewire_core::rand_alphanumeric;

/// Serving configuration shared by every socket of a handler.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Key signing the session cookie. The default is random per process,
    /// which invalidates cookies across restarts; set it explicitly in
    /// production.
    pub session_key: Vec<u8>,
    /// Name of the session cookie.
    pub session_cookie: String,
    /// A socket quiet past this deadline is closed.
    pub idle_timeout: Duration,
    /// Optional per-callback deadline; exceeding it fails the dispatch.
    pub handler_timeout: Option<Duration>,
    /// Bounded inbound frame queue; overflow closes the connection.
    pub inbound_queue: usize,
    /// Bounded outbound frame queue; the loop parks while it drains.
    pub outbound_queue: usize,
    /// A drain stalled past this closes the socket as a slow client.
    pub write_timeout: Duration,
    /// Undecodable frames tolerated per connection before closing.
    pub protocol_error_limit: u32,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            session_key: rand_alphanumeric(32).into_bytes(),
            session_cookie: "live-session".to_string(),
            idle_timeout: Duration::from_secs(300),
            handler_timeout: None,
            inbound_queue: 64,
            outbound_queue: 64,
            write_timeout: Duration::from_secs(10),
            protocol_error_limit: 8,
        }
    }
}
