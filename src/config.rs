//! Call manager configuration.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::events::CallObserver;

/// One STUN/TURN server entry, as consumed by the negotiation engine. The
/// core never decides relay topology; it only forwards this configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        urls: Vec<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls,
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Public-IP discovery works without credentials; deployments add their own
/// TURN relays on top for NAT situations direct traversal cannot handle.
static DEFAULT_ICE_SERVERS: Lazy<Vec<IceServerConfig>> =
    Lazy::new(|| vec![IceServerConfig::stun("stun:stun.l.google.com:19302")]);

/// Configuration for the call manager.
#[derive(Clone, Default)]
pub struct CallConfig {
    /// ICE servers handed to every negotiation engine.
    pub ice_servers: Vec<IceServerConfig>,
    /// Optional observer for UI-facing call events.
    pub observer: Option<Arc<dyn CallObserver>>,
}

impl CallConfig {
    pub fn new() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = servers;
        self
    }
}

impl std::fmt::Debug for CallConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallConfig")
            .field("ice_servers", &self.ice_servers)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
