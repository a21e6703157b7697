//! Live view configuration: mount, render, and the event registry.
//!
//! A [`LiveView`] binds a mount callback, a renderer, and a table of event
//! callbacks to one URL. It is built once at startup and immutable afterward;
//! every live socket for the view shares the same registry.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::component::Component;
use crate::error::LiveError;
use crate::pubsub::PubSub;
use crate::socket::Socket;
use livewire_core::protocol::{EventData, EVENT_PARAMS};
use livewire_core::template::{Template, TemplateSet};
use livewire_core::tree::RenderTree;

/// Boxed future type for stored async callbacks.
pub(crate) type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub(crate) type MountFn<S> =
    Arc<dyn Fn(Socket) -> BoxedFuture<anyhow::Result<S>> + Send + Sync>;
pub(crate) type EventFn<S> =
    Arc<dyn Fn(Socket, S, EventData) -> BoxedFuture<anyhow::Result<S>> + Send + Sync>;
pub(crate) type ErrorFn = Arc<dyn Fn(&LiveError) -> Response + Send + Sync>;

/// How the view turns assigns into a render tree.
pub(crate) enum Renderer<S> {
    /// The default template engine over a JSON scope.
    Template {
        template: Template,
        partials: TemplateSet,
        _marker: PhantomData<fn(S)>,
    },
    /// A user-supplied render callback.
    Func(Arc<dyn Fn(&S) -> anyhow::Result<RenderTree> + Send + Sync>),
}

impl<S: Serialize> Renderer<S> {
    /// Renders assigns, splicing in component subtrees.
    ///
    /// Component state is exposed to the template scope under
    /// `components.<id>` so parent templates can read it directly.
    pub(crate) fn render(
        &self,
        assigns: &S,
        subtrees: &HashMap<String, RenderTree>,
        component_states: &HashMap<String, Value>,
    ) -> anyhow::Result<RenderTree> {
        match self {
            Renderer::Template { template, partials, .. } => {
                let mut scope = serde_json::to_value(assigns)?;
                if !component_states.is_empty() {
                    if let Value::Object(map) = &mut scope {
                        map.insert(
                            "components".into(),
                            Value::Object(
                                component_states
                                    .iter()
                                    .map(|(k, v)| (k.clone(), v.clone()))
                                    .collect(),
                            ),
                        );
                    }
                }
                Ok(template.render_in(&scope, partials, subtrees)?)
            }
            Renderer::Func(f) => f(assigns),
        }
    }
}

/// The server-side object binding mount, render, and an event table to a URL.
pub struct LiveView<S> {
    pub(crate) mount: MountFn<S>,
    pub(crate) renderer: Renderer<S>,
    pub(crate) events: HashMap<String, EventFn<S>>,
    pub(crate) params: Option<EventFn<S>>,
    pub(crate) connect: Option<EventFn<S>>,
    pub(crate) disconnect: Option<EventFn<S>>,
    pub(crate) error_handler: ErrorFn,
    pub(crate) components: HashMap<String, Component>,
    pub(crate) pubsub: PubSub,
}

impl<S> LiveView<S>
where
    S: Clone + Serialize + Send + Sync + 'static,
{
    /// Creates a view rendering through the default template engine.
    pub fn with_template<M, Fut>(mount: M, template: Template) -> Self
    where
        M: Fn(Socket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
    {
        Self::build(
            mount,
            Renderer::Template {
                template,
                partials: TemplateSet::default(),
                _marker: PhantomData,
            },
        )
    }

    /// Creates a view rendering through a callback.
    pub fn with_renderer<M, Fut, R>(mount: M, render: R) -> Self
    where
        M: Fn(Socket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
        R: Fn(&S) -> anyhow::Result<RenderTree> + Send + Sync + 'static,
    {
        Self::build(mount, Renderer::Func(Arc::new(render)))
    }

    fn build<M, Fut>(mount: M, renderer: Renderer<S>) -> Self
    where
        M: Fn(Socket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
    {
        Self {
            mount: Arc::new(move |socket| Box::pin(mount(socket))),
            renderer,
            events: HashMap::new(),
            params: None,
            connect: None,
            disconnect: None,
            error_handler: Arc::new(default_error_handler),
            components: HashMap::new(),
            pubsub: PubSub::in_process(),
        }
    }

    /// Registers a named sub-template for `{{template "name"}}` calls.
    ///
    /// Only meaningful for template-rendered views; ignored otherwise.
    pub fn partial(mut self, name: impl Into<String>, template: Template) -> Self {
        if let Renderer::Template { partials, .. } = &mut self.renderer {
            partials.insert(name, template);
        }
        self
    }

    /// Registers an event callback under `name`.
    ///
    /// The returned assigns replace the previous value atomically; an error
    /// leaves state untouched and surfaces to the client as an `err` push.
    ///
    /// # Panics
    ///
    /// Panics when `name` is a reserved event name.
    pub fn on<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Socket, S, EventData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
    {
        let name = name.into();
        assert!(
            name != EVENT_PARAMS && !name.is_empty(),
            "{name:?} is a reserved event name"
        );
        self.events.insert(name, box_handler(handler));
        self
    }

    /// Registers the callback for URL parameter changes.
    pub fn on_params<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Socket, S, EventData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
    {
        self.params = Some(box_handler(handler));
        self
    }

    /// Registers a lifecycle callback run once the live session is up.
    pub fn on_connect<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Socket, S, EventData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
    {
        self.connect = Some(box_handler(handler));
        self
    }

    /// Registers a lifecycle callback run when the session ends.
    pub fn on_disconnect<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Socket, S, EventData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
    {
        self.disconnect = Some(box_handler(handler));
        self
    }

    /// Sets the handler turning pre-session errors into HTTP responses.
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&LiveError) -> Response + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Adds a named sub-view component.
    pub fn component(mut self, component: Component) -> Self {
        self.components.insert(component.id.clone(), component);
        self
    }

    /// Replaces the pub/sub bus (default: in-process).
    pub fn pubsub(mut self, pubsub: PubSub) -> Self {
        self.pubsub = pubsub;
        self
    }
}

fn box_handler<S, F, Fut>(handler: F) -> EventFn<S>
where
    F: Fn(Socket, S, EventData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
{
    Arc::new(move |socket, assigns, data| Box::pin(handler(socket, assigns, data)))
}

fn default_error_handler(err: &LiveError) -> Response {
    error!(%err, "live view request failed");
    let status = match err {
        LiveError::Handshake(_) | LiveError::Session(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    status.into_response()
}
