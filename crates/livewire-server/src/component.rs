//! Named sub-views composed into a parent live view.
//!
//! A component is a small live view of its own: an id, a mount producing its
//! initial state, a render, and an event table. Its state lives beside the
//! parent's assigns in the socket loop, and its rendering lands as a nested
//! subtree wherever the parent template says `{{component "id"}}`. Inbound
//! events named `id:event` route to the component's table; only the changed
//! subtree's dynamics travel to the client.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::socket::Socket;
use crate::view::BoxedFuture;
use livewire_core::protocol::EventData;
use livewire_core::template::Template;
use livewire_core::tree::RenderTree;

type MountFn = Arc<dyn Fn() -> Value + Send + Sync>;
type EventFn =
    Arc<dyn Fn(Socket, Value, EventData) -> BoxedFuture<anyhow::Result<Value>> + Send + Sync>;

enum ComponentRenderer {
    Template(Template),
    Func(Arc<dyn Fn(&Value) -> anyhow::Result<RenderTree> + Send + Sync>),
}

/// A named sub-view with its own state, render, and event table.
pub struct Component {
    pub(crate) id: String,
    mount: MountFn,
    renderer: ComponentRenderer,
    events: HashMap<String, EventFn>,
}

impl Component {
    /// Starts a component rendering through the given template. State mounts
    /// as `null` until [`Component::mount`] is set.
    pub fn new(id: impl Into<String>, template: Template) -> Self {
        Self {
            id: id.into(),
            mount: Arc::new(|| Value::Null),
            renderer: ComponentRenderer::Template(template),
            events: HashMap::new(),
        }
    }

    /// Starts a component rendering through a callback instead of a template.
    pub fn with_renderer<R>(id: impl Into<String>, render: R) -> Self
    where
        R: Fn(&Value) -> anyhow::Result<RenderTree> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            mount: Arc::new(|| Value::Null),
            renderer: ComponentRenderer::Func(Arc::new(render)),
            events: HashMap::new(),
        }
    }

    /// Sets the mount callback producing the component's initial state.
    pub fn mount<F>(mut self, mount: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.mount = Arc::new(mount);
        self
    }

    /// Registers an event callback. The client addresses it as `id:name`.
    pub fn on<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Socket, Value, EventData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.events.insert(
            name.into(),
            Arc::new(move |socket, state, data| Box::pin(handler(socket, state, data))),
        );
        self
    }

    pub(crate) fn initial_state(&self) -> Value {
        (self.mount)()
    }

    pub(crate) fn render(&self, state: &Value) -> anyhow::Result<RenderTree> {
        match &self.renderer {
            ComponentRenderer::Template(t) => Ok(t.render(state)?),
            ComponentRenderer::Func(f) => f(state),
        }
    }

    pub(crate) fn handler(&self, name: &str) -> Option<&EventFn> {
        self.events.get(name)
    }
}
