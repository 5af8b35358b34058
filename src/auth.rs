//! Public-key authentication for the tunnel servers.
//!
//! Two modes: an authorized-keys file, or an upstream HTTP auth service
//! that receives the offered key and decides. Fingerprints are the
//! `SHA256:` form `ssh-keygen -l` prints.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use russh::keys::PublicKey;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::context::SessionContext;

/// Reduce an authorized_keys-style line to its `algorithm base64` pair,
/// validating the payload and dropping any trailing comment.
pub fn normalize_key_line(line: &str) -> Result<String> {
    let mut fields = line.split_whitespace();
    let (Some(algorithm), Some(blob)) = (fields.next(), fields.next()) else {
        return Err(anyhow!("malformed public key line"));
    };
    base64::engine::general_purpose::STANDARD
        .decode(blob)
        .context("public key payload is not valid base64")?;
    Ok(format!("{algorithm} {blob}"))
}

/// SHA256 fingerprint of a public key, in the `SHA256:` form that
/// `ssh-keygen -l` prints: unpadded base64 of the wire-format digest.
pub fn fingerprint(key: &PublicKey) -> String {
    use russh::keys::PublicKeyBase64;

    let digest = Sha256::digest(key.public_key_bytes());
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    )
}

/// Render a public key as the OpenSSH `algorithm base64` pair, no comment.
pub fn openssh_key(key: &PublicKey) -> String {
    use russh::keys::PublicKeyBase64;

    format!("{} {}", key.algorithm().as_str(), key.public_key_base64())
}

/// Check a host key against an optional fingerprint pin.
///
/// With no pin configured every host key is accepted; the pin may be given
/// with or without the `SHA256:` prefix.
pub fn host_key_allowed(pin: Option<&str>, key: &PublicKey) -> bool {
    let Some(pin) = pin else {
        return true;
    };
    let got = fingerprint(key);
    let want = pin.trim();
    got == want || got.strip_prefix("SHA256:") == Some(want)
}

/// Keys loaded from an authorized_keys-style file.
pub struct AuthorizedKeys {
    keys: HashSet<String>,
}

impl AuthorizedKeys {
    /// Load and normalize key entries. Comment and blank lines are skipped;
    /// unparseable lines are logged and skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read authorized keys file {}", path.display()))?;

        let mut keys = HashSet::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match normalize_key_line(line) {
                Ok(entry) => {
                    keys.insert(entry);
                }
                Err(err) => warn!("skipping unparseable authorized key line: {err}"),
            }
        }

        info!("loaded {} authorized key(s) from {}", keys.len(), path.display());
        Ok(Self { keys })
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys.contains(&openssh_key(key))
    }

    #[cfg(test)]
    fn from_lines(content: &str) -> Self {
        let keys = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| normalize_key_line(line).ok())
            .collect();
        Self { keys }
    }
}

/// Context slot: the user record the auth service returned.
#[derive(Clone, Debug)]
pub struct UserRecord(pub serde_json::Value);

#[derive(Serialize)]
struct AuthRequest<'a> {
    auth_key: &'a str,
    remote_addr: String,
    user: &'a str,
}

/// Client for the upstream HTTP auth service.
pub struct AuthService {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl AuthService {
    pub fn new(url: String, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("tunman/0.1")
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self { client, url, token }
    }

    /// POST the offered key; 200 means the key is accepted. The response
    /// body, when it is JSON, is the user record of the accepted identity.
    pub async fn check(
        &self,
        key: &PublicKey,
        remote_addr: SocketAddr,
        user: &str,
    ) -> Result<Option<serde_json::Value>> {
        let auth_key = openssh_key(key);
        let body = AuthRequest {
            auth_key: &auth_key,
            remote_addr: remote_addr.to_string(),
            user,
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("auth service request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            info!(
                "auth service {} rejected key for user {} with status {}",
                self.url, user, status
            );
            return Err(AuthRejected.into());
        }

        debug!("auth service accepted key for user {user}");
        let record = response.json::<serde_json::Value>().await.ok();
        Ok(record)
    }
}

/// Marker error: the auth service answered, and the answer was no.
#[derive(Debug)]
struct AuthRejected;

impl std::fmt::Display for AuthRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("key rejected by auth service")
    }
}

impl std::error::Error for AuthRejected {}

/// The server's auth callback.
pub enum Authorizer {
    AuthorizedKeys(AuthorizedKeys),
    Service(AuthService),
    /// Accept every key. Only for demo deployments without a keys file.
    Open,
}

impl Authorizer {
    /// Decide on an offered key. On acceptance by the auth service, the
    /// returned user record is attached to the session context.
    pub async fn authorize(&self, ctx: &SessionContext, user: &str, key: &PublicKey) -> bool {
        match self {
            Authorizer::AuthorizedKeys(keys) => keys.contains(key),
            Authorizer::Service(service) => {
                match service.check(key, ctx.remote_addr(), user).await {
                    Ok(record) => {
                        if let Some(record) = record {
                            ctx.set(UserRecord(record));
                        }
                        true
                    }
                    Err(err) if err.is::<AuthRejected>() => false,
                    Err(err) => {
                        warn!("auth service error, rejecting key: {err}");
                        false
                    }
                }
            }
            Authorizer::Open => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_LINE: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl test@example.com";

    #[test]
    fn normalize_key_line_strips_the_comment() {
        let entry = normalize_key_line(KEY_LINE).unwrap();
        assert_eq!(
            entry,
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl"
        );
    }

    #[test]
    fn normalize_key_line_rejects_bad_input() {
        assert!(normalize_key_line("ssh-ed25519").is_err());
        assert!(normalize_key_line("ssh-ed25519 not!base64?").is_err());
        assert!(normalize_key_line("").is_err());
    }

    #[test]
    fn fingerprint_has_the_ssh_keygen_form() {
        let fp = fingerprint(&test_key());
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='), "fingerprints use unpadded base64");
        assert_eq!(fp, fingerprint(&test_key()));
    }

    #[test]
    fn openssh_key_renders_algorithm_and_blob() {
        let rendered = openssh_key(&test_key());
        assert_eq!(rendered, normalize_key_line(KEY_LINE).unwrap());
    }

    #[test]
    fn authorized_keys_skips_comments_and_blanks() {
        let content = format!("# comment\n\n{}\nnot a key\n", KEY_LINE);
        let keys = AuthorizedKeys::from_lines(&content);
        assert_eq!(keys.keys.len(), 1);
        assert!(keys
            .keys
            .contains("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl"));
    }

    fn test_key() -> PublicKey {
        russh::keys::PublicKey::from_openssh(KEY_LINE).unwrap()
    }

    #[test]
    fn authorized_keys_match_ignores_the_comment() {
        let keys = AuthorizedKeys::from_lines(KEY_LINE);
        assert!(keys.contains(&test_key()));
    }

    #[test]
    fn host_key_pin_matches_with_or_without_prefix() {
        let key = test_key();
        let fp = fingerprint(&key);
        assert!(host_key_allowed(None, &key));
        assert!(host_key_allowed(Some(&fp), &key));
        assert!(host_key_allowed(Some(fp.strip_prefix("SHA256:").unwrap()), &key));
        assert!(!host_key_allowed(Some("SHA256:000000"), &key));
    }

    /// Minimal HTTP server: consumes one request, answers with a canned
    /// status and body.
    async fn fake_auth_service(status: &'static str, body: &'static str) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    loop {
                        let Ok(n) = conn.read(&mut buf).await else { return };
                        if n == 0 {
                            break;
                        }
                        request.extend_from_slice(&buf[..n]);
                        if request_complete(&request) {
                            break;
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = conn.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text
            .lines()
            .find_map(|line| line.to_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    #[tokio::test]
    async fn auth_service_acceptance_attaches_the_user_record() {
        let addr = fake_auth_service("200 OK", r#"{"name":"alice"}"#).await;
        let authorizer = Authorizer::Service(AuthService::new(
            format!("http://{addr}/key"),
            Some("t0k".to_string()),
        ));
        let ctx = SessionContext::new("127.0.0.1:40022".parse().unwrap());

        assert!(authorizer.authorize(&ctx, "alice", &test_key()).await);
        let record = ctx.get::<UserRecord>().expect("user record attached");
        assert_eq!(record.0["name"], "alice");
    }

    #[tokio::test]
    async fn auth_service_rejection_refuses_the_key() {
        let addr = fake_auth_service("403 Forbidden", "denied").await;
        let authorizer = Authorizer::Service(AuthService::new(format!("http://{addr}/key"), None));
        let ctx = SessionContext::new("127.0.0.1:40022".parse().unwrap());

        assert!(!authorizer.authorize(&ctx, "alice", &test_key()).await);
        assert!(ctx.get::<UserRecord>().is_none());
    }

    #[tokio::test]
    async fn unreachable_auth_service_refuses_the_key() {
        // Reserve a port, then free it so the request is refused.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let authorizer = Authorizer::Service(AuthService::new(format!("http://{addr}/key"), None));
        let ctx = SessionContext::new("127.0.0.1:40022".parse().unwrap());
        assert!(!authorizer.authorize(&ctx, "alice", &test_key()).await);
    }
}
