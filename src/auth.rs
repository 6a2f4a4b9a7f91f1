//! Access-token sources and the single-flight refresh coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::ChatError;

pub const ACCESS_TOKEN_VAR: &str = "CHAT_ACCESS_TOKEN";

#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// The current token, if one is available.
    async fn credential(&self) -> Option<String>;

    /// Obtains a fresh token.
    async fn refresh(&self) -> Result<String, ChatError>;
}

/// A fixed token. Refreshing hands back the same value.
#[derive(Debug, Clone)]
pub struct StaticCredential(pub String);

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn credential(&self) -> Option<String> {
        Some(self.0.clone()).filter(|t| !t.trim().is_empty())
    }

    async fn refresh(&self) -> Result<String, ChatError> {
        self.credential().await.ok_or_else(|| ChatError::Credential("no token configured".into()))
    }
}

/// Reads the token from an environment variable. Refreshing reloads `.env`
/// so a token rotated on disk is picked up.
#[derive(Debug, Clone)]
pub struct EnvCredentialSource {
    var: String,
}

impl EnvCredentialSource {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredentialSource {
    fn default() -> Self {
        Self::new(ACCESS_TOKEN_VAR)
    }
}

#[async_trait]
impl CredentialSource for EnvCredentialSource {
    async fn credential(&self) -> Option<String> {
        std::env::var(&self.var).ok().filter(|t| !t.trim().is_empty())
    }

    async fn refresh(&self) -> Result<String, ChatError> {
        if let Err(e) = dotenvy::dotenv_override() {
            debug!("No .env reloaded: {e}");
        }
        self.credential()
            .await
            .ok_or_else(|| ChatError::Credential(format!("{} is not set", self.var)))
    }
}

type InFlight = Shared<BoxFuture<'static, Result<String, String>>>;

/// Collapses concurrent refreshes into one call on the wrapped source.
/// Every caller waiting while a refresh is in flight gets its result.
pub struct RefreshCoordinator {
    source: Arc<dyn CredentialSource>,
    in_flight: Mutex<Option<InFlight>>,
}

impl RefreshCoordinator {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self { source, in_flight: Mutex::new(None) }
    }

    pub async fn credential(&self) -> Option<String> {
        self.source.credential().await
    }

    pub async fn refresh(&self) -> Result<String, ChatError> {
        let shared = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(running) if running.peek().is_none() => {
                    debug!("Joining in-flight credential refresh");
                    running.clone()
                }
                _ => {
                    info!("Refreshing credential");
                    let source = Arc::clone(&self.source);
                    let refresh = async move { source.refresh().await.map_err(|e| e.to_string()) }
                        .boxed()
                        .shared();
                    *slot = Some(refresh.clone());
                    refresh
                }
            }
        };
        shared.await.map_err(ChatError::Credential)
    }
}

#[async_trait]
impl CredentialSource for RefreshCoordinator {
    async fn credential(&self) -> Option<String> {
        RefreshCoordinator::credential(self).await
    }

    async fn refresh(&self) -> Result<String, ChatError> {
        RefreshCoordinator::refresh(self).await
    }
}
