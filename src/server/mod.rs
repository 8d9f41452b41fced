//! Collector HTTP surface: applies inbound metric updates to storage.

mod handlers;
mod subnet;

pub use self::handlers::router;
pub use self::subnet::{SubnetError, TrustedSubnet};

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::codec::{CodecError, Decryptor};
use crate::config::ServerConfig;
use crate::export::health::HealthMetrics;
use crate::metric::MetricError;
use crate::storage::{Storage, StorageError};

/// Shared state for axum handlers.
pub struct AppState<S> {
    pub storage: Arc<S>,
    /// HMAC key; empty disables verification and response signing.
    pub key: String,
    pub decryptor: Option<Arc<Decryptor>>,
    pub subnet: Option<TrustedSubnet>,
    pub health: Option<Arc<HealthMetrics>>,
}

impl<S> AppState<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            key: String::new(),
            decryptor: None,
            subnet: None,
            health: None,
        }
    }
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            key: self.key.clone(),
            decryptor: self.decryptor.clone(),
            subnet: self.subnet,
            health: self.health.clone(),
        }
    }
}

/// Request failure mapped to an HTTP status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Metric(#[from] MetricError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) | Self::Metric(_) | Self::Codec(_) => StatusCode::BAD_REQUEST,
            Self::Storage(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            Self::Storage(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

/// Collector server bound to `address`.
pub struct Server<S> {
    address: String,
    state: AppState<S>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl<S: Storage> Server<S> {
    pub fn new(
        cfg: &ServerConfig,
        storage: Arc<S>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Self> {
        let decryptor = cfg
            .crypto_key
            .as_deref()
            .map(|path| {
                Decryptor::load(path)
                    .map(Arc::new)
                    .with_context(|| format!("loading private key {}", path.display()))
            })
            .transpose()?;

        let state = AppState {
            storage,
            key: cfg.key.clone(),
            decryptor,
            subnet: cfg.trusted_subnet()?,
            health,
        };

        Ok(Self {
            address: cfg.address.clone(),
            state,
            task: None,
        })
    }

    /// Binds and serves until `cancel` fires. Returns the bound address.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("listening on {}", self.address))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let app = router(self.state.clone());

        self.task = Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        }));

        info!(
            addr = %local_addr,
            signed = !self.state.key.is_empty(),
            encrypted = self.state.decryptor.is_some(),
            trusted_subnet = ?self.state.subnet.map(|s| s.to_string()),
            "collector started",
        );

        Ok(local_addr)
    }

    /// Waits for the serve task to finish after cancellation.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        task.await
            .context("collector task panicked")?
            .context("serving collector")?;

        info!("collector stopped");
        Ok(())
    }
}
