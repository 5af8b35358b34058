//! Outbound tunnel manager.
//!
//! Runs next to a Docker daemon and keeps the set of remote forwards on an
//! upstream SSH server equal to the set derived from live containers:
//! every (monitored network, exposed port, DNS name) combination becomes
//! one `tcpip-forward` upstream, and inbound `forwarded-tcpip` channels
//! are bridged to the matching container endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use russh::client;
use russh::keys::PublicKey;
use russh::Channel;
use tokio::net::TcpStream;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info};

use crate::auth;
use crate::bridge::bridge;
use crate::config::ManagerConfig;
use crate::docker::{expand_tunnels, ContainerEvent, ContainerSpec, DockerClient};
use crate::tunnel::{connect_upstream, split_host_port};

/// One active tunnel: the upstream bind it owns and the container endpoint
/// it dials.
pub struct TunHandler {
    pub remote_addr: String,
    pub local_addr: String,
    shutdown: watch::Sender<bool>,
}

impl TunHandler {
    fn new(remote_addr: String, local_addr: String) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            remote_addr,
            local_addr,
            shutdown,
        })
    }

    /// A draining tunnel no longer accepts new channels; in-flight bridges
    /// run to completion.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// `container_id → (remote_addr → handler)`.
pub type TunnelSet = Arc<RwLock<HashMap<String, HashMap<String, Arc<TunHandler>>>>>;

pub fn new_tunnel_set() -> TunnelSet {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Find the live handler owning `remote_addr`, if any.
pub async fn resolve_tunnel(tunnels: &TunnelSet, remote_addr: &str) -> Option<Arc<TunHandler>> {
    let tunnels = tunnels.read().await;
    for handlers in tunnels.values() {
        if let Some(handler) = handlers.get(remote_addr) {
            if !handler.is_shutdown() {
                return Some(Arc::clone(handler));
            }
        }
    }
    None
}

/// Sends `tcpip-forward` / `cancel-tcpip-forward` requests upstream.
#[async_trait]
pub trait ForwardRequester: Send + Sync {
    /// Returns the port the server actually bound (0 when it echoed none).
    async fn request_forward(&self, addr: String, port: u32) -> Result<u32>;
    async fn cancel_forward(&self, addr: String, port: u32) -> Result<()>;
}

/// Requester backed by the persistent upstream SSH connection.
pub struct UpstreamRequester<H: client::Handler> {
    handle: client::Handle<H>,
}

impl<H: client::Handler> UpstreamRequester<H> {
    pub fn new(handle: client::Handle<H>) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl<H> ForwardRequester for UpstreamRequester<H>
where
    H: client::Handler + Send + Sync + 'static,
{
    async fn request_forward(&self, addr: String, port: u32) -> Result<u32> {
        let mut handle = self.handle.clone();
        let assigned = handle
            .tcpip_forward(addr, port)
            .await
            .context("tcpip-forward request denied by peer")?;
        Ok(assigned)
    }

    async fn cancel_forward(&self, addr: String, port: u32) -> Result<()> {
        let mut handle = self.handle.clone();
        handle
            .cancel_tcpip_forward(addr, port)
            .await
            .context("cancel-tcpip-forward request failed")?;
        Ok(())
    }
}

/// The reconciler's state: requests forwards and records the handlers the
/// channel handler resolves against.
pub struct TunnelManager<R: ForwardRequester> {
    requester: R,
    tunnels: TunnelSet,
}

impl<R: ForwardRequester> TunnelManager<R> {
    pub fn new(requester: R, tunnels: TunnelSet) -> Self {
        Self { requester, tunnels }
    }

    /// Request one remote forward and record its handler.
    ///
    /// A requested port of 0 is replaced by the port the server assigned,
    /// and the recorded remote address reflects it.
    pub async fn add_tunnel(
        &self,
        container_id: &str,
        remote_addr: &str,
        local_addr: &str,
    ) -> Result<String> {
        let (remote_host, remote_port) = split_host_port(remote_addr)?;
        let assigned = self
            .requester
            .request_forward(remote_host.clone(), remote_port)
            .await?;
        let effective_port = if assigned != 0 { assigned } else { remote_port };
        let remote_addr = format!("{remote_host}:{effective_port}");

        let handler = TunHandler::new(remote_addr.clone(), local_addr.to_string());
        let mut tunnels = self.tunnels.write().await;
        tunnels
            .entry(container_id.to_string())
            .or_default()
            .insert(remote_addr.clone(), handler);
        Ok(remote_addr)
    }

    /// Drop every tunnel of a container: signal each handler, cancel its
    /// upstream forward, delete the entries. Cancellation errors are logged
    /// and do not abort the sweep.
    pub async fn remove_tunnels(&self, container_id: &str) -> Result<()> {
        let handlers = { self.tunnels.write().await.remove(container_id) };
        let Some(handlers) = handlers else {
            bail!("no tunnels recorded for container {container_id}");
        };

        for (remote_addr, handler) in handlers {
            info!(container_id, remote = %remote_addr, "closing tunnel");
            handler.signal_shutdown();
            match split_host_port(&remote_addr) {
                Ok((host, port)) => {
                    if let Err(err) = self.requester.cancel_forward(host, port).await {
                        error!(remote = %remote_addr, "failed to cancel remote forward: {err}");
                    }
                }
                Err(err) => error!(remote = %remote_addr, "unparseable tunnel address: {err}"),
            }
        }
        Ok(())
    }

    /// Reconcile one started container: add a tunnel per expansion entry.
    /// The batch is not atomic, failures are logged and skipped.
    pub async fn container_started(&self, spec: &ContainerSpec, monitored: &[String]) {
        for plan in expand_tunnels(spec, monitored) {
            info!(
                container_id = %spec.id,
                remote = %plan.remote_addr,
                local = %plan.local_addr,
                "adding tunnel"
            );
            if let Err(err) = self
                .add_tunnel(&spec.id, &plan.remote_addr, &plan.local_addr)
                .await
            {
                error!(remote = %plan.remote_addr, "unable to start tunnel: {err}");
            }
        }
    }
}

/// russh client handler for the persistent upstream connection.
pub struct ManagerHandler {
    tunnels: TunnelSet,
    pin: Option<String>,
}

impl ManagerHandler {
    pub fn new(tunnels: TunnelSet, pin: Option<String>) -> Self {
        Self { tunnels, pin }
    }
}

impl client::Handler for ManagerHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(auth::host_key_allowed(self.pin.as_deref(), server_public_key))
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let remote_addr = format!("{connected_address}:{connected_port}");
        let Some(handler) = resolve_tunnel(&self.tunnels, &remote_addr).await else {
            info!(remote = %remote_addr, "no tunnel for forwarded channel, refusing");
            let _ = channel.close().await;
            return Ok(());
        };

        debug!(
            remote = %remote_addr,
            origin = %format!("{originator_address}:{originator_port}"),
            local = %handler.local_addr,
            "bridging forwarded channel"
        );
        tokio::spawn(async move {
            match TcpStream::connect(&handler.local_addr).await {
                Ok(local) => bridge(channel.into_stream(), local).await,
                Err(err) => {
                    error!(local = %handler.local_addr, "failed to dial container endpoint: {err}");
                    let _ = channel.close().await;
                }
            }
        });
        Ok(())
    }
}

async fn spawn_health_server(addr: &str) -> Result<()> {
    let app = Router::new().route("/health", get(|| async { StatusCode::OK }));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind health endpoint on {addr}"))?;
    info!(addr, "health endpoint listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!("health server error: {err}");
        }
    });
    Ok(())
}

/// Run the manager until a fatal error.
///
/// Failures of the upstream SSH connection or the Docker event stream are
/// deliberately fatal: the process exits non-zero and its orchestrator
/// restarts it.
pub async fn run(config: ManagerConfig) -> Result<()> {
    let docker = DockerClient::connect().await?;

    let monitored = match &config.networks {
        Some(networks) => networks.clone(),
        None => docker.self_networks().await?,
    };
    info!(?monitored, "monitoring networks");

    let tunnels = new_tunnel_set();
    let handler = ManagerHandler::new(
        Arc::clone(&tunnels),
        config.upstream.host_key_fingerprint.clone(),
    );
    let handle = connect_upstream(&config.upstream, handler).await?;
    let manager = TunnelManager::new(UpstreamRequester::new(handle), Arc::clone(&tunnels));

    spawn_health_server(&config.health_addr).await?;

    // Subscribe before the initial sweep so no start event is missed.
    let mut events = docker.container_events();

    for container_id in docker.list_running_ids().await? {
        match docker.inspect(&container_id).await {
            Ok(spec) => manager.container_started(&spec, &monitored).await,
            Err(err) => error!(%container_id, "unable to inspect container: {err}"),
        }
    }

    while let Some(event) = events.next().await {
        match event.context("error receiving events from daemon")? {
            ContainerEvent::Start(container_id) => match docker.inspect(&container_id).await {
                Ok(spec) => manager.container_started(&spec, &monitored).await,
                Err(err) => {
                    error!(%container_id, "unable to inspect started container: {err}")
                }
            },
            ContainerEvent::Die(container_id) => {
                if let Err(err) = manager.remove_tunnels(&container_id).await {
                    error!(%container_id, "unable to remove tunnels: {err}");
                }
            }
            ContainerEvent::Other => debug!("ignoring daemon event"),
        }
    }

    bail!("docker event stream ended")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::ContainerNetwork;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockState {
        ops: Mutex<Vec<String>>,
        next_port: Mutex<u32>,
        fail_remotes: Vec<String>,
        fail_cancels: bool,
    }

    #[derive(Clone)]
    struct MockRequester(Arc<MockState>);

    impl MockRequester {
        fn new() -> Self {
            Self(Arc::new(MockState {
                next_port: Mutex::new(40000),
                ..Default::default()
            }))
        }

        fn ops(&self) -> Vec<String> {
            self.0.ops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ForwardRequester for MockRequester {
        async fn request_forward(&self, addr: String, port: u32) -> Result<u32> {
            if self.0.fail_remotes.contains(&format!("{addr}:{port}")) {
                bail!("denied by peer");
            }
            self.0.ops.lock().unwrap().push(format!("forward {addr}:{port}"));
            if port != 0 {
                return Ok(port);
            }
            let mut next = self.0.next_port.lock().unwrap();
            *next += 1;
            Ok(*next)
        }

        async fn cancel_forward(&self, addr: String, port: u32) -> Result<()> {
            self.0.ops.lock().unwrap().push(format!("cancel {addr}:{port}"));
            if self.0.fail_cancels {
                bail!("cancel refused");
            }
            Ok(())
        }
    }

    fn manager(requester: MockRequester) -> TunnelManager<MockRequester> {
        TunnelManager::new(requester, new_tunnel_set())
    }

    #[tokio::test]
    async fn add_tunnel_keeps_a_fixed_port() {
        let requester = MockRequester::new();
        let manager = manager(requester.clone());

        let remote = manager
            .add_tunnel("c1", "api:80", "172.20.0.5:80")
            .await
            .unwrap();
        assert_eq!(remote, "api:80");
        assert_eq!(requester.ops(), vec!["forward api:80"]);

        let handler = resolve_tunnel(&manager.tunnels, "api:80").await.unwrap();
        assert_eq!(handler.local_addr, "172.20.0.5:80");
    }

    #[tokio::test]
    async fn add_tunnel_recomputes_an_ephemeral_port() {
        let requester = MockRequester::new();
        let manager = manager(requester.clone());

        let remote = manager
            .add_tunnel("c1", "api:0", "172.20.0.5:80")
            .await
            .unwrap();
        assert_eq!(remote, "api:40001");
        assert!(resolve_tunnel(&manager.tunnels, "api:40001").await.is_some());
        assert!(resolve_tunnel(&manager.tunnels, "api:0").await.is_none());
    }

    #[tokio::test]
    async fn remove_tunnels_cancels_the_recorded_addresses() {
        let requester = MockRequester::new();
        let manager = manager(requester.clone());

        manager.add_tunnel("c1", "api:80", "172.20.0.5:80").await.unwrap();
        manager.add_tunnel("c1", "api:0", "172.20.0.5:81").await.unwrap();
        manager.remove_tunnels("c1").await.unwrap();

        let ops = requester.ops();
        assert!(ops.contains(&"cancel api:80".to_string()));
        assert!(
            ops.contains(&"cancel api:40001".to_string()),
            "cancellation must use the reassigned port: {ops:?}"
        );
        assert!(resolve_tunnel(&manager.tunnels, "api:80").await.is_none());
        assert!(manager.tunnels.read().await.get("c1").is_none());
    }

    #[tokio::test]
    async fn remove_tunnels_survives_cancel_errors() {
        let requester = MockRequester(Arc::new(MockState {
            next_port: Mutex::new(40000),
            fail_cancels: true,
            ..Default::default()
        }));
        let manager = manager(requester.clone());

        manager.add_tunnel("c1", "a:80", "ip:80").await.unwrap();
        manager.add_tunnel("c1", "b:80", "ip:80").await.unwrap();
        manager.remove_tunnels("c1").await.unwrap();

        let cancels = requester.ops().iter().filter(|op| op.starts_with("cancel")).count();
        assert_eq!(cancels, 2, "every tunnel is cancelled even when cancels fail");
        assert!(manager.tunnels.read().await.is_empty());
    }

    #[tokio::test]
    async fn remove_tunnels_for_an_unknown_container_errors() {
        let manager = manager(MockRequester::new());
        assert!(manager.remove_tunnels("nope").await.is_err());
    }

    #[tokio::test]
    async fn container_start_adds_the_full_expansion_and_skips_failures() {
        let requester = MockRequester(Arc::new(MockState {
            next_port: Mutex::new(40000),
            fail_remotes: vec!["web:80".to_string()],
            ..Default::default()
        }));
        let manager = manager(requester.clone());

        let spec = ContainerSpec {
            id: "0123456789abcdef".to_string(),
            name: "web".to_string(),
            networks: HashMap::from([(
                "frontend".to_string(),
                ContainerNetwork {
                    ip_address: "172.20.0.7".to_string(),
                    dns_names: vec!["web.frontend".to_string()],
                },
            )]),
            exposed_ports: vec![80],
        };
        manager.container_started(&spec, &["frontend".to_string()]).await;

        // Names: short id, "web" (request denied), "web.frontend".
        assert!(resolve_tunnel(&manager.tunnels, "0123456789ab:80").await.is_some());
        assert!(resolve_tunnel(&manager.tunnels, "web.frontend:80").await.is_some());
        assert!(
            resolve_tunnel(&manager.tunnels, "web:80").await.is_none(),
            "a denied forward is not recorded"
        );
    }

    #[tokio::test]
    async fn draining_handlers_no_longer_resolve() {
        let manager = manager(MockRequester::new());
        manager.add_tunnel("c1", "api:80", "ip:80").await.unwrap();

        let handler = resolve_tunnel(&manager.tunnels, "api:80").await.unwrap();
        handler.signal_shutdown();
        assert!(resolve_tunnel(&manager.tunnels, "api:80").await.is_none());
    }
}
