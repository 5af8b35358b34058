//! Pub/sub command surface.
//!
//! Non-TTY sessions on the pubsub server get two commands: `ls` prints the
//! current remote forwards, `emit <msg>` fans an HTTP GET out across them.
//! Each forward is one subscriber; the emitting session is the publisher.

use reqwest::Url;
use tracing::warn;

use crate::auth;
use crate::forwards::ForwardInfo;

#[derive(Debug, Clone, PartialEq)]
pub enum PubSubCommand {
    Ls,
    Emit(String),
}

/// Recognize a pub/sub command line. `None` falls through to the next
/// handler.
pub fn parse_command(line: &str) -> Option<PubSubCommand> {
    let mut it = line.split_whitespace();
    match it.next()? {
        "ls" => Some(PubSubCommand::Ls),
        "emit" => it.next().map(|msg| PubSubCommand::Emit(msg.to_string())),
        _ => None,
    }
}

/// Run a command against the current forwards.
///
/// Returns `(exit_status, output)`. `emit` is best-effort: per-destination
/// failures are logged and the sweep continues, but they turn the exit
/// status to 1.
pub async fn execute(
    command: PubSubCommand,
    forwards: &[ForwardInfo],
    client: &reqwest::Client,
) -> (u32, String) {
    match command {
        PubSubCommand::Ls => {
            if forwards.is_empty() {
                return (0, "no listeners\n".to_string());
            }
            let mut out = String::new();
            for forward in forwards {
                let fp = forward
                    .public_key
                    .as_ref()
                    .map(auth::fingerprint)
                    .unwrap_or_else(|| "unknown".to_string());
                out.push_str(&format!("addr:{} pubkey:{}\n", forward.local_addr, fp));
            }
            (0, out)
        }
        PubSubCommand::Emit(msg) => {
            if forwards.is_empty() {
                return (0, "no listeners\n".to_string());
            }
            let mut out = String::new();
            let mut failed = false;
            for forward in forwards {
                let base = format!("http://{}/", forward.local_addr);
                let url = match Url::parse_with_params(&base, &[("msg", msg.as_str())]) {
                    Ok(url) => url,
                    Err(err) => {
                        warn!("invalid listener url {base}: {err}");
                        failed = true;
                        continue;
                    }
                };
                out.push_str(&format!("[GET] {url}\n"));
                if let Err(err) = client.get(url.clone()).send().await {
                    warn!("unable to send message to {url}: {err}");
                    failed = true;
                }
            }
            (u32::from(failed), out)
        }
    }
}
