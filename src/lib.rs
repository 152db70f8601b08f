//! opsgate
//!
//! An authenticated HTTP gateway for running whitelisted network commands.
//! Requests flow through a fixed pipeline (auth, rate limit, policy
//! validation, sandboxed execution, audit), and a separate posture manager
//! toggles firewall/proxy/vpn/tor dimensions.

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod metrics_server;
pub mod policy;
pub mod posture;
pub mod rate_limit;
pub mod sandbox;
pub mod server;
pub mod validator;
