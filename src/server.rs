//! SSH server for the tunnel fabric.
//!
//! Handles:
//! - Public key authentication via the configured [`Authorizer`]
//! - `direct-tcpip` channels, terminated against a [`Tunnel`] provider
//! - `tcpip-forward` / `cancel-tcpip-forward` via the forward registry
//! - The pub/sub command surface on non-PTY exec sessions

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::auth::Authorizer;
use crate::bridge::bridge;
use crate::config::ServerConfig;
use crate::context::SessionContext;
use crate::forwards::{ChannelOpener, ForwardRegistry};
use crate::pubsub;
use crate::tunnel::Tunnel;

/// Shared state for one server instance. The subcommands compose it from
/// the engines they enable.
pub struct ServerState {
    authorizer: Authorizer,
    tunnel: Option<Arc<dyn Tunnel>>,
    forwards: Option<Arc<ForwardRegistry>>,
    pubsub_cli: bool,
    http_client: reqwest::Client,
}

impl ServerState {
    pub fn new(authorizer: Authorizer) -> Self {
        Self {
            authorizer,
            tunnel: None,
            forwards: None,
            pubsub_cli: false,
            http_client: reqwest::Client::new(),
        }
    }

    /// Terminate `direct-tcpip` channels against the given tunnel.
    pub fn with_tunnel(mut self, tunnel: Arc<dyn Tunnel>) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    /// Enable remote forwards plus the `ls`/`emit` command surface.
    pub fn with_pubsub(mut self) -> Self {
        self.forwards = Some(ForwardRegistry::new());
        self.pubsub_cli = true;
        self
    }
}

/// Per-connection handler state.
struct ConnectionHandler {
    state: Arc<ServerState>,
    ctx: Arc<SessionContext>,
    has_pty: bool,
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Let the client proceed to the signature; the decision happens in
        // `auth_publickey`.
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let remote_addr = self.ctx.remote_addr();
        if self
            .state
            .authorizer
            .authorize(&self.ctx, user, public_key)
            .await
        {
            info!(user, %remote_addr, "public key accepted");
            self.ctx.set_user(user);
            self.ctx.set_public_key(public_key.clone());
            Ok(Auth::Accept)
        } else {
            info!(user, %remote_addr, "public key rejected");
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("session channel opened: {:?}", channel.id());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        _channel_id: ChannelId,
        term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(term, "pty requested");
        self.has_pty = true;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let handle = session.handle();
        tokio::spawn(async move {
            finish_exec(
                &handle,
                channel_id,
                1,
                "this server only accepts non-interactive commands\n",
            )
            .await;
        });
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        debug!(command, "exec request");
        let handle = session.handle();

        // The pub/sub surface only exists for non-PTY sessions.
        let recognized = if self.state.pubsub_cli && !self.has_pty {
            pubsub::parse_command(&command)
        } else {
            None
        };

        match (recognized, self.state.forwards.clone()) {
            (Some(command), Some(registry)) => {
                let client = self.state.http_client.clone();
                tokio::spawn(async move {
                    let forwards = registry.snapshot();
                    let (status, output) = pubsub::execute(command, &forwards, &client).await;
                    finish_exec(&handle, channel_id, status, &output).await;
                });
            }
            _ => {
                tokio::spawn(async move {
                    finish_exec(&handle, channel_id, 127, "unknown command\n").await;
                });
            }
        }
        Ok(())
    }

    /// Handle a `direct-tcpip` channel open (local forward).
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(tunnel) = self.state.tunnel.clone() else {
            info!("direct-tcpip is not enabled on this server");
            return Ok(false);
        };

        info!(
            target = %format!("{host_to_connect}:{port_to_connect}"),
            origin = %format!("{originator_address}:{originator_port}"),
            "local forward request"
        );

        // Acquire the backend here, in the session's own task: per-session
        // resources (the web tunnel's listener) are only ever touched from
        // one task this way. A failed backend refuses the open; the session
        // itself survives.
        match tunnel.create_conn(&self.ctx).await {
            Ok(backend) => {
                tokio::spawn(bridge(channel.into_stream(), backend));
                Ok(true)
            }
            Err(err) => {
                error!("unable to open backend connection: {err}");
                Ok(false)
            }
        }
    }

    /// Handle a `tcpip-forward` request (remote forward).
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(registry) = self.state.forwards.clone() else {
            info!("remote forwarding is not enabled on this server");
            return Ok(false);
        };

        let opener: Arc<dyn ChannelOpener> = Arc::new(session.handle());
        match registry.register(opener, &self.ctx, address, *port).await {
            Ok(effective) => {
                *port = effective;
                Ok(true)
            }
            Err(err) => {
                error!(address, "tcpip-forward failed: {err}");
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match &self.state.forwards {
            Some(registry) => {
                // Unknown keys reply success too: cancellation is idempotent.
                registry.cancel(address, port);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

async fn finish_exec(handle: &Handle, channel_id: ChannelId, status: u32, output: &str) {
    if !output.is_empty() {
        let _ = handle
            .data(channel_id, CryptoVec::from_slice(output.as_bytes()))
            .await;
    }
    let _ = handle.exit_status_request(channel_id, status).await;
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
}

/// Run the SSH server until interrupted, then drain connections within a
/// 30-second grace period.
pub async fn run_server(config: &ServerConfig, state: Arc<ServerState>) -> Result<()> {
    config.ensure_dirs()?;
    let key = host_key(&config.host_key_path).await?;

    let russh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    });

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("SSH server listening on {}", listener.local_addr()?);

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                let state = Arc::clone(&state);
                let russh_config = Arc::clone(&russh_config);
                connections.spawn(async move {
                    let ctx = Arc::new(SessionContext::new(peer_addr));
                    let handler = ConnectionHandler {
                        state: Arc::clone(&state),
                        ctx: Arc::clone(&ctx),
                        has_pty: false,
                    };
                    match russh::server::run_stream(russh_config, stream, handler).await {
                        Ok(session) => {
                            if let Err(err) = session.await {
                                warn!("SSH session error: {err}");
                            }
                        }
                        Err(err) => warn!("SSH connection error: {err}"),
                    }

                    // The connection is over: wake lifetime watchers, then
                    // release whatever the tunnel attached to the session.
                    ctx.close();
                    if let Some(tunnel) = &state.tunnel {
                        if let Err(err) = tunnel.close(&ctx).await {
                            warn!("tunnel cleanup error: {err}");
                        }
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down, draining connections");
                break;
            }
        }

        while connections.try_join_next().is_some() {}
    }

    drop(listener);
    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("grace period elapsed, aborting remaining sessions");
        connections.shutdown().await;
    }
    Ok(())
}

/// The server's host key: read from `path` when one is there, otherwise a
/// fresh Ed25519 key persisted for the next start.
async fn host_key(path: &Path) -> Result<russh::keys::PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        debug!(path = %path.display(), "loading host key");
        return russh::keys::load_secret_key(path, None)
            .with_context(|| format!("unusable host key at {}", path.display()));
    }

    let generated = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .context("host key generation failed")?;
    let encoded = generated
        .to_openssh(LineEnding::LF)
        .context("host key encoding failed")?;
    persist_host_key(path, encoded.as_bytes()).await?;
    info!(path = %path.display(), "generated new Ed25519 host key");
    Ok(generated)
}

/// Write a fresh host key, owner-readable only from the moment it exists.
async fn persist_host_key(path: &Path, encoded: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(path)
        .await
        .with_context(|| format!("cannot write host key to {}", path.display()))?;
    file.write_all(encoded).await?;
    Ok(())
}
