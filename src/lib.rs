//! tunman: SSH reverse-tunnel fabric.
//!
//! Exposes backends over authenticated SSH channels instead of public TCP
//! ports. Two directions are supported:
//!
//! - `direct-tcpip` termination: a client's local forward is answered with a
//!   backend chosen by a [`tunnel::Tunnel`] provider (an in-process HTTP
//!   endpoint on a per-session unix socket, or a dialed remote backend).
//! - `tcpip-forward` fan-out: the server binds listeners on behalf of
//!   clients and relays every accepted connection back as a
//!   `forwarded-tcpip` channel. The pub/sub surface and the Docker-driven
//!   tunnel manager are layered on top of this.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod context;
pub mod docker;
pub mod forwards;
pub mod manager;
pub mod pubsub;
pub mod server;
pub mod tunnel;
pub mod web;
