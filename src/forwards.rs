//! Remote-forward registry and engine.
//!
//! `tcpip-forward` binds a TCP listener on behalf of the requesting
//! session; every accepted connection is relayed back to that session as a
//! `forwarded-tcpip` channel and bridged. Entries live in a server-global
//! registry so the pub/sub surface can enumerate every subscriber.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use russh::keys::PublicKey;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::bridge::bridge;
use crate::context::SessionContext;
use crate::tunnel::TunnelStream;

/// Opens `forwarded-tcpip` channels back to a session's client.
#[async_trait]
pub trait ChannelOpener: Send + Sync + 'static {
    async fn open_forwarded_tcpip(
        &self,
        dest_addr: String,
        dest_port: u32,
        origin_addr: String,
        origin_port: u32,
    ) -> Result<TunnelStream>;
}

#[async_trait]
impl ChannelOpener for russh::server::Handle {
    async fn open_forwarded_tcpip(
        &self,
        dest_addr: String,
        dest_port: u32,
        origin_addr: String,
        origin_port: u32,
    ) -> Result<TunnelStream> {
        let channel = self
            .channel_open_forwarded_tcpip(dest_addr, dest_port, origin_addr, origin_port)
            .await
            .context("forwarded-tcpip channel open failed")?;
        Ok(Box::new(channel.into_stream()))
    }
}

struct ForwardEntry {
    bind_addr: String,
    requested_port: u32,
    effective_port: u32,
    local_addr: SocketAddr,
    public_key: Option<PublicKey>,
    stop: oneshot::Sender<()>,
}

/// Read-only view of one registered forward.
#[derive(Clone)]
pub struct ForwardInfo {
    pub bind_addr: String,
    pub requested_port: u32,
    pub effective_port: u32,
    pub local_addr: SocketAddr,
    pub public_key: Option<PublicKey>,
}

fn entry_key(bind_addr: &str, port: u32) -> String {
    format!("{bind_addr}:{port}")
}

/// Server-global registry of active remote forwards.
///
/// Entries are keyed by `bind_addr:effective_port`, which the bind itself
/// keeps unique; cancellation resolves the originally requested
/// address/port against entries, so forwards requested on port 0 stay
/// cancellable with the key the client knows.
#[derive(Default)]
pub struct ForwardRegistry {
    forwards: Mutex<HashMap<String, ForwardEntry>>,
}

impl ForwardRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind `bind_addr:bind_port` (port 0 allowed) and start forwarding
    /// accepted connections back over `opener`. Returns the effective port.
    ///
    /// Two detached tasks are spawned per registration: the accept loop and
    /// a watcher that tears the forward down when the session ends.
    pub async fn register(
        self: &Arc<Self>,
        opener: Arc<dyn ChannelOpener>,
        ctx: &Arc<SessionContext>,
        bind_addr: &str,
        bind_port: u32,
    ) -> Result<u32> {
        let port = u16::try_from(bind_port).context("bind port out of range")?;
        let listener = TcpListener::bind((bind_addr, port))
            .await
            .with_context(|| format!("failed to bind {bind_addr}:{bind_port}"))?;
        let local_addr = listener.local_addr()?;
        let effective_port = u32::from(local_addr.port());
        let key = entry_key(bind_addr, effective_port);

        let (stop_tx, stop_rx) = oneshot::channel();
        {
            let mut forwards = self.forwards.lock().expect("forwards lock poisoned");
            forwards.insert(
                key.clone(),
                ForwardEntry {
                    bind_addr: bind_addr.to_string(),
                    requested_port: bind_port,
                    effective_port,
                    local_addr,
                    public_key: ctx.public_key().cloned(),
                    stop: stop_tx,
                },
            );
        }
        info!(bind = %key, requested_port = bind_port, "remote forward registered");

        let watcher = {
            let registry = Arc::clone(self);
            let key = key.clone();
            let done = ctx.done();
            async move {
                done.await;
                registry.shut_down(&key);
            }
        };
        tokio::spawn(watcher);

        let loop_task = accept_loop(
            Arc::clone(self),
            key,
            listener,
            stop_rx,
            opener,
            bind_addr.to_string(),
            effective_port,
        );
        tokio::spawn(loop_task);

        Ok(effective_port)
    }

    /// Cancel every forward matching the requested `bind_addr`/`bind_port`.
    ///
    /// The requested port is the primary key (port 0 cancels ephemeral
    /// registrations); matching on the effective port is accepted too.
    /// Unknown addresses are fine, cancellation is idempotent.
    pub fn cancel(&self, bind_addr: &str, bind_port: u32) {
        let removed: Vec<ForwardEntry> = {
            let mut forwards = self.forwards.lock().expect("forwards lock poisoned");
            let keys: Vec<String> = forwards
                .iter()
                .filter(|(_, entry)| {
                    entry.bind_addr == bind_addr
                        && (entry.requested_port == bind_port || entry.effective_port == bind_port)
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| forwards.remove(key)).collect()
        };
        for entry in removed {
            info!(
                bind = %entry_key(&entry.bind_addr, entry.effective_port),
                "cancelling remote forward"
            );
            let _ = entry.stop.send(());
        }
    }

    /// Consistent view of the current forwards, ordered by bind key.
    pub fn snapshot(&self) -> Vec<ForwardInfo> {
        let forwards = self.forwards.lock().expect("forwards lock poisoned");
        let mut infos: Vec<ForwardInfo> = forwards
            .values()
            .map(|entry| ForwardInfo {
                bind_addr: entry.bind_addr.clone(),
                requested_port: entry.requested_port,
                effective_port: entry.effective_port,
                local_addr: entry.local_addr,
                public_key: entry.public_key.clone(),
            })
            .collect();
        infos.sort_by_key(|info| entry_key(&info.bind_addr, info.effective_port));
        infos
    }

    pub fn is_empty(&self) -> bool {
        self.forwards.lock().expect("forwards lock poisoned").is_empty()
    }

    /// Remove an entry and close its listener.
    fn shut_down(&self, key: &str) {
        let entry = self.forwards.lock().expect("forwards lock poisoned").remove(key);
        if let Some(entry) = entry {
            debug!(bind = %key, "removing remote forward");
            let _ = entry.stop.send(());
        }
    }

    /// Drop an entry whose accept loop already ended.
    fn forget(&self, key: &str) {
        self.forwards.lock().expect("forwards lock poisoned").remove(key);
    }
}

async fn accept_loop(
    registry: Arc<ForwardRegistry>,
    key: String,
    listener: TcpListener,
    mut stop: oneshot::Receiver<()>,
    opener: Arc<dyn ChannelOpener>,
    bind_addr: String,
    effective_port: u32,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = &mut stop => {
                debug!(bind = %key, "closing remote forward listener");
                break;
            }
        };

        match accepted {
            Ok((conn, peer)) => {
                let opener = Arc::clone(&opener);
                let dest_addr = bind_addr.clone();
                tokio::spawn(async move {
                    let channel = opener
                        .open_forwarded_tcpip(
                            dest_addr,
                            effective_port,
                            peer.ip().to_string(),
                            u32::from(peer.port()),
                        )
                        .await;
                    match channel {
                        Ok(channel) => bridge(channel, conn).await,
                        // Dropping `conn` closes the accepted connection.
                        Err(err) => error!("failed to open forwarded-tcpip channel: {err}"),
                    }
                });
            }
            Err(err) => {
                error!(bind = %key, "accept failed, removing forward: {err}");
                break;
            }
        }
    }
    registry.forget(&key);
}
