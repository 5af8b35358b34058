//! Web tunnel: an in-process HTTP endpoint on a per-session unix socket.
//!
//! The first `direct-tcpip` channel of a session lazily materializes a
//! unix-domain listener plus an axum serve task for it; every channel of
//! the session then dials the same socket. Teardown is connection-scoped.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::Router;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::auth;
use crate::context::SessionContext;
use crate::tunnel::{Tunnel, TunnelStream};

/// Builds the per-session router; receives the context so handlers can read
/// the authenticated identity.
pub type RouterFactory = Arc<dyn Fn(&SessionContext) -> Router + Send + Sync>;

/// Context slot: filesystem path of the session's unix socket.
#[derive(Clone)]
struct TunnelSocketPath(PathBuf);

/// Context slot: the serve task owning the session's listener.
struct ServeTask(JoinHandle<()>);

pub struct WebTunnel {
    factory: RouterFactory,
}

impl WebTunnel {
    pub fn new(factory: RouterFactory) -> Self {
        Self { factory }
    }

    /// Default router: greets the authenticated identity on every path.
    pub fn identity_router(ctx: &SessionContext) -> Router {
        let user = ctx.user().unwrap_or("anonymous").to_string();
        let fp = ctx
            .public_key()
            .map(auth::fingerprint)
            .unwrap_or_else(|| "unknown".to_string());
        Router::new().fallback(move || {
            let body = format!("Hello, {user}!\nYour pubkey: {fp}\n");
            async move { body }
        })
    }

    /// Materialize the session's listener and serve task, or return the
    /// existing socket path. Failures leave the context untouched.
    async fn ensure_listener(&self, ctx: &Arc<SessionContext>) -> Result<PathBuf> {
        if let Some(TunnelSocketPath(path)) = ctx.get::<TunnelSocketPath>() {
            return Ok(path);
        }

        // Reserve a unique name by creating and removing a temp file, then
        // bind the socket on the freed path.
        let reserved = tempfile::Builder::new()
            .prefix("tunman-")
            .suffix(".sock")
            .tempfile()
            .context("failed to reserve a socket path")?;
        let path = reserved.path().to_path_buf();
        drop(reserved);

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("failed to bind unix socket {}", path.display()))?;
        debug!("serving session endpoint on {}", path.display());

        let router = (self.factory)(ctx);
        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                error!("session http server error: {err}");
            }
        });

        ctx.set(TunnelSocketPath(path.clone()));
        ctx.set(ServeTask(task));
        Ok(path)
    }
}

#[async_trait]
impl Tunnel for WebTunnel {
    async fn create_conn(&self, ctx: &Arc<SessionContext>) -> Result<TunnelStream> {
        let path = self.ensure_listener(ctx).await?;
        let stream = UnixStream::connect(&path)
            .await
            .with_context(|| format!("failed to dial session socket {}", path.display()))?;
        Ok(Box::new(stream))
    }

    async fn close(&self, ctx: &Arc<SessionContext>) -> Result<()> {
        if let Some(ServeTask(task)) = ctx.take::<ServeTask>() {
            task.abort();
        }
        if let Some(TunnelSocketPath(path)) = ctx.take::<TunnelSocketPath>() {
            let _ = std::fs::remove_file(&path);
            debug!("removed session socket {}", path.display());
        }
        Ok(())
    }
}
