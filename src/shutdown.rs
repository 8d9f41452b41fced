//! Signal handling and error joining for coordinated shutdown.

use std::fmt;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Every error collected while a role was running or draining.
#[derive(Debug)]
pub struct JoinedError(pub Vec<anyhow::Error>);

impl JoinedError {
    /// `Ok` when nothing was collected.
    pub fn into_result(self) -> Result<(), JoinedError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    pub fn errors(&self) -> &[anyhow::Error] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<anyhow::Error>> for JoinedError {
    fn from(errors: Vec<anyhow::Error>) -> Self {
        Self(errors)
    }
}

impl fmt::Display for JoinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => f.write_str("no errors"),
            [only] => write!(f, "{only:#}"),
            all => {
                write!(f, "{} errors:", all.len())?;
                for e in all {
                    write!(f, "\n  - {e:#}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for JoinedError {}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn wait_for_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listening for SIGINT")?;
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}
