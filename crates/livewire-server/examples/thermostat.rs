//! A minimal live view: a thermostat whose temperature lives on the server.
//!
//! Run with `cargo run --example thermostat`, then open the printed URL.

use anyhow::Result;
use clap::Parser;
use livewire_core::Template;
use livewire_server::{LiveConfig, LiveHandler, LiveView};
use serde::Serialize;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// A server-rendered thermostat demo.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the web server on.
    #[clap(long, default_value = "127.0.0.1:8080", env = "LIVEWIRE_BIND")]
    bind: String,
}

#[derive(Clone, Serialize)]
struct Thermostat {
    c: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let template = Template::parse(
        "<h1>Thermostat</h1>\
         <div class=\"reading\">{{.c}} &deg;C</div>\
         <button live-click=\"down\">-</button>\
         <button live-click=\"up\">+</button>",
    )?;

    let view = LiveView::with_template(
        |socket| async move {
            info!(session = %socket.id(), connected = socket.connected(), "mounting");
            Ok(Thermostat { c: 19.5 })
        },
        template,
    )
    .on("up", |_socket, mut state: Thermostat, _data| async move {
        state.c += 0.5;
        Ok(state)
    })
    .on("down", |socket, mut state: Thermostat, _data| async move {
        state.c -= 0.5;
        if state.c < 10.0 {
            socket.push_event("warning", json!({ "message": "getting cold" }));
        }
        Ok(state)
    });

    let app = LiveHandler::new(view, LiveConfig::default()).router("/");

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    info!("listening on http://{}", args.bind);
    axum::serve(listener, app).await?;
    Ok(())
}
