use crate::backend::RestClient;
use crate::config::Config;
use crate::csi::metrics::{CsiMetrics, serve_metrics};
use crate::csi::proto::{
    controller_server::ControllerServer, identity_server::IdentityServer, node_server::NodeServer,
};
use crate::csi::{ControllerService, IdentityService, NodeService};
use crate::mount::HostMounter;
use anyhow::{Context, Result, bail};
use prometheus::Registry;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tonic::transport::Server;
use tower_http::trace::TraceLayer;

/// Which CSI plane this process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    Node,
    Controller,
}

/// Resolve a CSI endpoint to a socket path. Accepts `unix://<path>` or a bare path.
pub fn socket_path(addr: &str) -> Result<PathBuf> {
    let path = match addr.split_once("://") {
        Some(("unix", path)) => path,
        Some((scheme, _)) => bail!("unsupported CSI endpoint scheme {}://, expected unix://", scheme),
        None => addr,
    };

    if path.is_empty() {
        bail!("empty CSI endpoint");
    }

    Ok(PathBuf::from(path))
}

/// CSI gRPC server
pub struct CsiServer {
    identity: IdentityService,
    controller: Option<ControllerService>,
    node: Option<NodeService>,
}

impl CsiServer {
    pub fn new(
        identity: IdentityService,
        controller: Option<ControllerService>,
        node: Option<NodeService>,
    ) -> Self {
        Self { identity, controller, node }
    }

    fn bind(path: &Path) -> Result<tokio::net::UnixListener> {
        // Remove existing socket if it exists
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove existing socket")?;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
        }

        tokio::net::UnixListener::bind(path)
            .with_context(|| format!("Failed to bind Unix socket {}", path.display()))
    }

    /// Serve on `addr` until `signal` resolves, then drain in-flight calls.
    pub async fn serve_with_shutdown<F>(self, addr: &str, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let path = socket_path(addr)?;
        let uds = Self::bind(&path)?;
        let uds_stream = tokio_stream::wrappers::UnixListenerStream::new(uds);

        let planes = match (&self.controller, &self.node) {
            (Some(_), Some(_)) => "Controller+Node",
            (Some(_), None) => "Controller",
            (None, Some(_)) => "Node",
            (None, None) => "Identity",
        };
        tracing::info!("CSI {} listening on {}", planes, path.display());

        Server::builder()
            .layer(TraceLayer::new_for_grpc())
            .add_service(IdentityServer::new(self.identity))
            .add_optional_service(self.controller.map(ControllerServer::new))
            .add_optional_service(self.node.map(NodeServer::new))
            .serve_with_incoming_shutdown(uds_stream, signal)
            .await
            .context("gRPC server error")?;

        tracing::info!("CSI server stopped");
        Ok(())
    }

    pub async fn serve(self, addr: &str) -> Result<()> {
        self.serve_with_shutdown(addr, shutdown_signal()).await
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

/// Build the services for `role` from `config` and serve until a signal arrives.
pub async fn run(role: Role, csi_address: &str, config: Config) -> Result<()> {
    let registry = Arc::new(Registry::new());
    let metrics =
        Arc::new(CsiMetrics::new(registry.clone()).context("Failed to register CSI metrics")?);

    if let Some(addr) = config.server.metrics_address.clone() {
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(registry, addr).await {
                tracing::error!("Metrics server failed: {:#}", e);
            }
        });
    }

    let identity = IdentityService::new();
    let server = match role {
        Role::Controller => {
            let backend = RestClient::new(&config.backend.endpoint)
                .context("Failed to create restvirt client")?;
            tracing::info!("Using restvirt API at {}", backend.endpoint());
            CsiServer::new(identity, Some(ControllerService::new(Arc::new(backend), metrics)), None)
        }
        Role::Node => {
            let node = NodeService::new(Arc::new(HostMounter::new()), config.node, metrics);
            CsiServer::new(identity, None, Some(node))
        }
    };

    server.serve(csi_address).await
}
