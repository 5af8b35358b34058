//! Tunnel providers.
//!
//! A [`Tunnel`] turns a session context into the backend stream that
//! `direct-tcpip` channels are bridged against. [`crate::web::WebTunnel`]
//! synthesizes an in-process HTTP endpoint; [`RawTunnel`] dials a fixed
//! backend through an outbound SSH client.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{anyhow, bail, Context as _, Result};
use async_trait::async_trait;
use russh::client::{self, AuthResult};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg, PublicKey};
use russh::ChannelStream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::info;

use crate::auth;
use crate::config::{RawForwardConfig, UpstreamConfig};
use crate::context::SessionContext;

/// Byte streams a tunnel can hand back.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// Capability that produces backend connections for a session.
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Obtain a backend connection for one `direct-tcpip` channel.
    async fn create_conn(&self, ctx: &Arc<SessionContext>) -> Result<TunnelStream>;

    /// Release per-session resources. Called once when the SSH connection
    /// ends; must be idempotent.
    async fn close(&self, _ctx: &Arc<SessionContext>) -> Result<()> {
        Ok(())
    }
}

/// Split `host:port` into its parts.
pub fn split_host_port(addr: &str) -> Result<(String, u32)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("address {addr:?} is missing a port"))?;
    let port: u32 = port
        .parse()
        .with_context(|| format!("invalid port in address {addr:?}"))?;
    Ok((host.to_string(), port))
}

/// Minimal russh client handler for outbound connections: host keys are
/// accepted unless a fingerprint pin is configured.
pub struct AcceptingClient {
    pin: Option<String>,
}

impl AcceptingClient {
    pub fn new(pin: Option<String>) -> Self {
        Self { pin }
    }
}

impl client::Handler for AcceptingClient {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(auth::host_key_allowed(self.pin.as_deref(), server_public_key))
    }
}

/// Dial and authenticate the upstream SSH server with the configured key.
pub async fn connect_upstream<H>(config: &UpstreamConfig, handler: H) -> Result<client::Handle<H>>
where
    H: client::Handler<Error = anyhow::Error> + Send + 'static,
{
    let key = load_secret_key(&config.key_location, config.key_passphrase.as_deref())
        .with_context(|| format!("failed to load key from {}", config.key_location.display()))?;

    let ssh_config = Arc::new(client::Config::default());
    let mut handle = client::connect(ssh_config, config.remote_host.as_str(), handler)
        .await
        .with_context(|| format!("failed to connect to {}", config.remote_host))?;

    let hash = handle.best_supported_rsa_hash().await?.flatten();
    let outcome = handle
        .authenticate_publickey(
            config.remote_user.clone(),
            PrivateKeyWithHashAlg::new(Arc::new(key), hash),
        )
        .await
        .context("public key authentication failed")?;
    if !matches!(outcome, AuthResult::Success) {
        bail!(
            "public key rejected by {} for user {}",
            config.remote_hostname,
            config.remote_user
        );
    }

    info!(
        host = %config.remote_host,
        user = %config.remote_user,
        "connected to upstream SSH server"
    );
    Ok(handle)
}

/// Tunnel that answers every channel by dialing a fixed backend address
/// through a fresh outbound SSH connection.
pub struct RawTunnel {
    config: RawForwardConfig,
}

impl RawTunnel {
    pub fn new(config: RawForwardConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Tunnel for RawTunnel {
    async fn create_conn(&self, _ctx: &Arc<SessionContext>) -> Result<TunnelStream> {
        let pin = self.config.upstream.host_key_fingerprint.clone();
        let handle = connect_upstream(&self.config.upstream, AcceptingClient::new(pin)).await?;

        let channel = match self.config.remote_protocol.as_str() {
            "tcp" => {
                let (host, port) = split_host_port(&self.config.remote_address)?;
                handle
                    .channel_open_direct_tcpip(host, port, "127.0.0.1", 0)
                    .await?
            }
            "unix" => {
                handle
                    .channel_open_direct_streamlocal(self.config.remote_address.clone())
                    .await?
            }
            other => bail!("unsupported remote protocol {other:?}"),
        };

        Ok(Box::new(DialedStream {
            stream: channel.into_stream(),
            _client: handle,
        }))
    }
}

/// Channel stream that keeps its SSH connection alive for as long as the
/// stream itself is.
struct DialedStream<H: client::Handler> {
    stream: ChannelStream<client::Msg>,
    _client: client::Handle<H>,
}

impl<H: client::Handler> AsyncRead for DialedStream<H> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl<H: client::Handler> AsyncWrite for DialedStream<H> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
