//! # Splice Entry Point
//!
//! The main executable of the `splice` proxy. This file drives the application lifecycle:
//!
//! 1. **Initialization**: Parses command-line arguments using [`cli::Cli`] and installs the
//!    `tracing` subscriber (filtered with `RUST_LOG`, `info` by default).
//! 2. **Routing**: Builds the [`routes::RoutingTable`] director from the configured backends.
//! 3. **Registration**: Wires the director into a `splice_core::ProxyServer`.
//! 4. **Serving**: Serves until interrupted or until the optional timeout elapses.
mod cli;
mod routes;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use routes::RoutingTable;
use splice_core::ProxyServer;
use std::time::Duration;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Cli::parse();

    let table = RoutingTable::new(
        args.backend.clone(),
        args.routes.clone(),
        args.reject_headers.clone(),
    )?;
    for upstream in table.upstreams() {
        tracing::info!(prefix = %upstream.prefix, backend = %upstream.url, "route");
    }

    let config = args.proxy_config();
    let content_subtype = config.content_subtype.clone();

    let mut builder = ProxyServer::builder(table)
        .config(config)
        .catch_all(!args.no_catch_all);
    for (service, method) in &args.registrations {
        builder = builder
            .register_service(service, &[method.as_str()])
            .with_context(|| format!("cannot register {service}/{method}"))?;
    }
    let proxy = builder.build();

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("cannot listen on {}", args.listen))?;
    let addr = listener.local_addr()?;

    tracing::info!(%addr, codec = %content_subtype, "starting splice proxy");

    Server::builder()
        .add_routes(proxy.into_routes())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown(args.timeout()))
        .await
        .context("proxy failed")?;

    tracing::info!("proxy stopped");
    Ok(())
}

async fn shutdown(timeout: Option<Duration>) {
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "cannot listen for shutdown signal");
            }
            tracing::info!("interrupted, shutting down");
        }
        _ = deadline => tracing::info!("timeout elapsed, shutting down"),
    }
}
