//! Prober seam: how the engine asks an endpoint what it is doing.
//!
//! The concrete wire protocol is an injected capability; the shipped
//! [`UdpProber`] speaks a minimal plain-text info exchange.

mod udp;

pub use udp::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("invalid probe configuration: {0}")]
    Config(String),
}

/// One observation of an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub online: bool,
    /// Self-reported endpoint name, falls back to the address when offline.
    pub name: String,
    /// Current activity label, e.g. a running map name.
    pub label: String,
    pub population: i64,
    pub capacity: i64,
}

impl Snapshot {
    /// Snapshot for an endpoint that did not answer.
    pub fn offline(name: &str) -> Self {
        Self {
            online: false,
            name: name.to_string(),
            label: crate::db::UNKNOWN_LABEL.to_string(),
            population: 0,
            capacity: 0,
        }
    }
}

/// Injected probing capability.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Query the endpoint at `address`, bounded by `timeout`.
    async fn probe(&self, address: &str, timeout: Duration) -> Result<Snapshot, ProbeError>;
}
