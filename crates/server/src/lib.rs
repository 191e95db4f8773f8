use std::sync::Arc;

use axum::http::Method;
use axum::Router;
use eyre::Result as EyreResult;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

pub mod ack;
pub mod broker;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod extension;
pub mod long_polling;
pub mod policy;
pub mod session;
mod sweeper;
mod waiter;

pub use bayeux_server_primitives as primitives;

use crate::broker::Broker;
use crate::config::ServerConfig;

/// Binds the configured listeners and serves the long-polling endpoint.
///
/// The transport is also usable without this: mount the router returned by
/// [`long_polling::service`] into a host application instead.
pub async fn start(config: ServerConfig, broker: Arc<Broker>) -> EyreResult<()> {
    let mut app = Router::new();

    let mut serviced = false;

    if let Some((path, handler)) = long_polling::service(&config, broker) {
        app = app.route(path, handler);
        serviced = true;
    }

    if !serviced {
        warn!("No services enabled, enable at least one service to start the server");

        return Ok(());
    }

    app = app.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_headers(Any)
            .allow_methods([Method::POST, Method::OPTIONS]),
    );

    let mut set = JoinSet::new();

    for addr in &config.listen {
        let listener = TcpListener::bind(addr).await?;
        let app = app.clone();
        drop(set.spawn(async move { axum::serve(listener, app).await }));
    }

    while let Some(result) = set.join_next().await {
        result??;
    }

    Ok(())
}
