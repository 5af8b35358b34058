//! Docker daemon integration for the tunnel manager.
//!
//! Wraps the bollard client behind the few calls the manager needs and
//! keeps the container → tunnel expansion a pure function over a
//! [`ContainerSpec`] so it can be exercised without a daemon.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Context, Result};
use bollard::models::{ContainerInspectResponse, EventMessage, EventMessageTypeEnum};
use bollard::query_parameters::{EventsOptions, InspectContainerOptions, ListContainersOptions};
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, info};

/// One network attachment of a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerNetwork {
    pub ip_address: String,
    pub dns_names: Vec<String>,
}

/// The slice of `inspect` output the reconciler works from.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub id: String,
    pub name: String,
    pub networks: HashMap<String, ContainerNetwork>,
    pub exposed_ports: Vec<u16>,
}

/// One remote forward the reconciler should hold for a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPlan {
    pub remote_addr: String,
    pub local_addr: String,
}

/// Container lifecycle events the manager acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    Start(String),
    Die(String),
    Other,
}

impl From<EventMessage> for ContainerEvent {
    fn from(event: EventMessage) -> Self {
        if event.typ != Some(EventMessageTypeEnum::CONTAINER) {
            return ContainerEvent::Other;
        }
        let id = event.actor.and_then(|actor| actor.id).unwrap_or_default();
        if id.is_empty() {
            return ContainerEvent::Other;
        }
        match event.action.as_deref() {
            Some("start") => ContainerEvent::Start(id),
            Some("die") => ContainerEvent::Die(id),
            _ => ContainerEvent::Other,
        }
    }
}

/// Expand a container into the tunnels it should have.
///
/// DNS names start as the short id plus the stripped container name and
/// grow with each monitored network's own names; the result is the
/// cross-product of monitored networks, exposed ports, and deduplicated
/// names, each mapped to the network IP of the container.
pub fn expand_tunnels(spec: &ContainerSpec, monitored: &[String]) -> Vec<TunnelPlan> {
    let short_id: String = spec.id.chars().take(12).collect();
    let mut dns_names = vec![short_id, spec.name.trim_start_matches('/').to_string()];
    dns_names.sort();
    dns_names.dedup();

    let mut ports = spec.exposed_ports.clone();
    ports.sort_unstable();
    ports.dedup();

    let mut network_names: Vec<&String> = spec.networks.keys().collect();
    network_names.sort();

    let mut plans = Vec::new();
    let mut seen = HashSet::new();
    for network_name in network_names {
        if !monitored.contains(&network_name.trim().to_lowercase()) {
            continue;
        }
        let network = &spec.networks[network_name];

        dns_names.extend(network.dns_names.iter().cloned());
        dns_names.sort();
        dns_names.dedup();

        for port in &ports {
            for name in &dns_names {
                let remote_addr = format!("{name}:{port}");
                if seen.insert(remote_addr.clone()) {
                    plans.push(TunnelPlan {
                        remote_addr,
                        local_addr: format!("{}:{}", network.ip_address, port),
                    });
                }
            }
        }
    }
    plans
}

fn spec_from_inspect(info: ContainerInspectResponse) -> Result<ContainerSpec> {
    let id = info.id.ok_or_else(|| anyhow!("container inspect response has no id"))?;
    let name = info
        .name
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_default();

    let mut exposed_ports = Vec::new();
    if let Some(ports) = info.config.and_then(|config| config.exposed_ports) {
        for spec in ports.keys() {
            // Keys look like "80/tcp".
            let number = spec.split('/').next().unwrap_or(spec);
            if let Ok(port) = number.parse::<u16>() {
                exposed_ports.push(port);
            }
        }
    }
    exposed_ports.sort_unstable();
    exposed_ports.dedup();

    let mut networks = HashMap::new();
    if let Some(settings) = info.network_settings.and_then(|settings| settings.networks) {
        for (network_name, endpoint) in settings {
            networks.insert(
                network_name,
                ContainerNetwork {
                    ip_address: endpoint.ip_address.unwrap_or_default(),
                    dns_names: endpoint.dns_names.unwrap_or_default(),
                },
            );
        }
    }

    Ok(ContainerSpec {
        id,
        name,
        networks,
        exposed_ports,
    })
}

/// Thin wrapper over the bollard client.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connect via the local daemon defaults and verify with a ping.
    pub async fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("failed to connect to Docker daemon")?;
        docker.ping().await.context("failed to ping Docker daemon")?;
        info!("connected to Docker daemon");
        Ok(Self { docker })
    }

    /// IDs of the currently running containers.
    pub async fn list_running_ids(&self) -> Result<Vec<String>> {
        let containers = self
            .docker
            .list_containers(None::<ListContainersOptions>)
            .await
            .context("failed to list containers")?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    pub async fn inspect(&self, container_id: &str) -> Result<ContainerSpec> {
        let info = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("failed to inspect container {container_id}"))?;
        spec_from_inspect(info)
    }

    /// Networks of the container this process runs in, found by hostname.
    /// Used when no `NETWORKS` list is configured.
    pub async fn self_networks(&self) -> Result<Vec<String>> {
        let hostname = match std::env::var("HOSTNAME") {
            Ok(hostname) if !hostname.trim().is_empty() => hostname.trim().to_string(),
            _ => tokio::fs::read_to_string("/etc/hostname")
                .await
                .context("cannot determine hostname; set NETWORKS explicitly")?
                .trim()
                .to_string(),
        };

        let spec = self.inspect(&hostname).await.context(
            "failed to inspect own container; set NETWORKS to the list to monitor",
        )?;
        let mut networks: Vec<String> = spec
            .networks
            .keys()
            .map(|name| name.trim().to_lowercase())
            .collect();
        networks.sort();
        debug!(?networks, "derived monitored networks from own container");
        Ok(networks)
    }

    /// Container lifecycle events, mapped down to [`ContainerEvent`].
    pub fn container_events(&self) -> BoxStream<'_, Result<ContainerEvent>> {
        self.docker
            .events(None::<EventsOptions>)
            .map(|item| item.map(ContainerEvent::from).map_err(anyhow::Error::from))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, EventActor, NetworkSettings};

    fn spec(networks: &[(&str, &str, &[&str])], ports: &[u16]) -> ContainerSpec {
        ContainerSpec {
            id: "0123456789abcdef0123".to_string(),
            name: "api".to_string(),
            networks: networks
                .iter()
                .map(|(name, ip, dns)| {
                    (
                        name.to_string(),
                        ContainerNetwork {
                            ip_address: ip.to_string(),
                            dns_names: dns.iter().map(|d| d.to_string()).collect(),
                        },
                    )
                })
                .collect(),
            exposed_ports: ports.to_vec(),
        }
    }

    #[test]
    fn expansion_is_the_cross_product_of_networks_ports_and_names() {
        let spec = spec(
            &[
                ("frontend", "172.20.0.5", &["api.frontend", "api"][..]),
                ("private", "172.21.0.5", &["api.private"][..]),
            ],
            &[80, 8080, 80],
        );
        let monitored = vec!["frontend".to_string()];

        let plans = expand_tunnels(&spec, &monitored);

        // Names: short id, container name (dedups with the network alias
        // "api"), "api.frontend": 3 distinct. Ports dedup to 2.
        assert_eq!(plans.len(), 3 * 2);
        assert!(plans.iter().all(|p| p.local_addr.starts_with("172.20.0.5:")));
        assert!(plans
            .iter()
            .any(|p| p.remote_addr == "0123456789ab:80"));
        assert!(plans.iter().any(|p| p.remote_addr == "api:8080"));
        assert!(plans.iter().any(|p| p.remote_addr == "api.frontend:80"));
        assert!(
            !plans.iter().any(|p| p.remote_addr.contains("api.private")),
            "unmonitored networks contribute nothing"
        );
    }

    #[test]
    fn expansion_with_no_monitored_networks_is_empty() {
        let spec = spec(&[("private", "172.21.0.5", &[][..])], &[80]);
        assert!(expand_tunnels(&spec, &["frontend".to_string()]).is_empty());
        assert!(expand_tunnels(&spec, &[]).is_empty());
    }

    #[test]
    fn monitored_network_match_is_case_insensitive() {
        let spec = spec(&[("Frontend", "172.20.0.5", &[][..])], &[80]);
        let plans = expand_tunnels(&spec, &["frontend".to_string()]);
        assert_eq!(plans.len(), 2);
    }

    #[test]
    fn inspect_response_maps_to_a_spec() {
        let mut exposed = HashMap::new();
        exposed.insert("80/tcp".to_string(), HashMap::new());
        exposed.insert("443/tcp".to_string(), HashMap::new());
        exposed.insert("53/udp".to_string(), HashMap::new());

        let mut networks = HashMap::new();
        networks.insert(
            "frontend".to_string(),
            bollard::models::EndpointSettings {
                ip_address: Some("172.20.0.9".to_string()),
                dns_names: Some(vec!["svc.frontend".to_string()]),
                ..Default::default()
            },
        );

        let info = ContainerInspectResponse {
            id: Some("deadbeefcafe0000".to_string()),
            name: Some("/svc".to_string()),
            config: Some(ContainerConfig {
                exposed_ports: Some(exposed),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        };

        let spec = spec_from_inspect(info).unwrap();
        assert_eq!(spec.name, "svc");
        assert_eq!(spec.exposed_ports, vec![53, 80, 443]);
        assert_eq!(spec.networks["frontend"].ip_address, "172.20.0.9");
        assert_eq!(spec.networks["frontend"].dns_names, vec!["svc.frontend"]);
    }

    #[test]
    fn event_mapping_keeps_start_and_die_only() {
        let event = |typ, action: &str| EventMessage {
            typ: Some(typ),
            action: Some(action.to_string()),
            actor: Some(EventActor {
                id: Some("abc123".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(
            ContainerEvent::from(event(EventMessageTypeEnum::CONTAINER, "start")),
            ContainerEvent::Start("abc123".to_string())
        );
        assert_eq!(
            ContainerEvent::from(event(EventMessageTypeEnum::CONTAINER, "die")),
            ContainerEvent::Die("abc123".to_string())
        );
        assert_eq!(
            ContainerEvent::from(event(EventMessageTypeEnum::CONTAINER, "pause")),
            ContainerEvent::Other
        );
        assert_eq!(
            ContainerEvent::from(event(EventMessageTypeEnum::NETWORK, "start")),
            ContainerEvent::Other
        );
        assert_eq!(ContainerEvent::from(EventMessage::default()), ContainerEvent::Other);
    }
}
