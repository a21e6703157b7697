//! Wire format between the browser client and the server.
//!
//! Every frame is a JSON object tagged by `t`. Inbound frames carry the
//! application event name in `n`, a free-form payload map in `d`, and an
//! optional client correlation id in `i` that drives the ack round-trip.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tree::{RenderTree, TreePatch};

/// Free-form event payload decoded from JSON.
pub type EventData = serde_json::Map<String, Value>;

/// Reserved inbound event name for URL changes.
pub const EVENT_PARAMS: &str = "params";

/// Push event name used to surface dispatch errors to client hooks.
pub const EVENT_ERR: &str = "err";

/// Push event name instructing the client to call `history.pushState`.
pub const EVENT_PUSHSTATE: &str = "pushstate";

/// A frame sent by the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "lowercase")]
pub enum ClientFrame {
    /// An application event bound through a `live-*` attribute.
    Event {
        /// Application-level event name.
        n: String,
        /// Event payload.
        #[serde(default, skip_serializing_if = "EventData::is_empty")]
        d: EventData,
        /// Client correlation id for the ack round-trip.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        i: Option<String>,
    },
    /// A URL change from `live-patch` navigation, carrying query parameters.
    Params {
        /// The new query parameters.
        #[serde(default, skip_serializing_if = "EventData::is_empty")]
        d: EventData,
        /// Client correlation id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        i: Option<String>,
    },
    /// An event raised by a client-side hook. An empty name is the hook
    /// mount ping.
    Hook {
        /// Hook event name.
        #[serde(default)]
        n: String,
        /// Event payload.
        #[serde(default, skip_serializing_if = "EventData::is_empty")]
        d: EventData,
        /// Client correlation id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        i: Option<String>,
    },
}

impl ClientFrame {
    /// Decodes a frame from its JSON text.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encodes the frame as JSON text.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("serde_json::to_string is infallible")
    }

    /// The correlation id, if the client attached one.
    pub fn id(&self) -> Option<&str> {
        match self {
            ClientFrame::Event { i, .. } | ClientFrame::Params { i, .. } | ClientFrame::Hook { i, .. } => {
                i.as_deref()
            }
        }
    }
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Baseline rendering: statics plus full dynamics.
    Render {
        /// The full render tree.
        d: RenderTree,
    },
    /// Sparse update against the last baseline.
    Patch {
        /// Changed dynamics only.
        d: TreePatch,
    },
    /// Full browser navigation.
    Redirect {
        /// Redirect target.
        d: RedirectPayload,
    },
    /// An event pushed to client-side hooks.
    Push {
        /// Event name and payload.
        d: PushPayload,
    },
    /// A protocol-level error surfaced before the connection closes.
    Err {
        /// Error detail.
        d: ErrPayload,
    },
    /// Acknowledges one inbound frame by its correlation id.
    Ack {
        /// The acknowledged correlation id.
        i: String,
    },
}

impl ServerFrame {
    /// Encodes the frame as JSON text.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("serde_json::to_string is infallible")
    }

    /// Decodes a frame from its JSON text.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Payload of a [`ServerFrame::Redirect`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedirectPayload {
    /// Absolute or relative URL to navigate to.
    pub url: String,
}

/// Payload of a [`ServerFrame::Push`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    /// Event name dispatched to client hooks.
    pub event: String,
    /// Free-form payload.
    pub payload: Value,
}

/// Payload of a [`ServerFrame::Err`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrPayload {
    /// Correlation id of the frame that failed, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Human-readable message.
    pub message: String,
}
