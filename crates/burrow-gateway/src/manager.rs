//! Listener manager
//!
//! The mutation and query surface over the configured tunnel set: which
//! client identities exist, which rules each one has, and the running
//! listener behind every rule.

use burrow_control::{
    CounterSnapshot, IoCounters, KeyStore, ListenerHandle, SessionRegistry,
    DEFAULT_UDP_IDLE_TIMEOUT,
};
use burrow_proto::{PublicProtocol, TunnelRule};
use burrow_server_tcp::{TcpServerError, TcpTunnelServer};
use burrow_server_udp::{UdpServerError, UdpTunnelServer};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("client {0} already exists")]
    ClientExists(String),

    #[error("client {0} not found")]
    ClientNotFound(String),

    #[error("tunnel {rule_id} already exists for client {identity}")]
    RuleExists { identity: String, rule_id: String },

    #[error("tunnel {rule_id} not found for client {identity}")]
    RuleNotFound { identity: String, rule_id: String },

    #[error(transparent)]
    Tcp(#[from] TcpServerError),

    #[error(transparent)]
    Udp(#[from] UdpServerError),
}

struct InstalledRule {
    rule: TunnelRule,
    listener: ListenerHandle,
}

/// Owns one listener per tunnel rule, grouped by client identity
pub struct ListenerManager {
    clients: Mutex<BTreeMap<String, Vec<InstalledRule>>>,
    registry: SessionRegistry,
    keys: Arc<KeyStore>,
    udp_idle_timeout: Duration,
}

impl ListenerManager {
    pub fn new(registry: SessionRegistry, keys: Arc<KeyStore>) -> Self {
        Self {
            clients: Mutex::new(BTreeMap::new()),
            registry,
            keys,
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
        }
    }

    /// Pseudo-session window for UDP listeners started after this call
    pub fn with_udp_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.udp_idle_timeout = idle_timeout;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// Registers a client identity and provisions its tunnel key.
    pub async fn add_client(&self, identity: &str) -> Result<(), ManagerError> {
        let mut clients = self.clients.lock().await;
        if clients.contains_key(identity) {
            return Err(ManagerError::ClientExists(identity.to_string()));
        }
        self.keys.provision(identity).await;
        clients.insert(identity.to_string(), Vec::new());
        info!(identity = %identity, "Client added");
        Ok(())
    }

    /// Removes a client, closing its listeners and its live session if any.
    pub async fn remove_client(&self, identity: &str) -> Result<(), ManagerError> {
        let removed = self.clients.lock().await.remove(identity);
        let Some(rules) = removed else {
            return Err(ManagerError::ClientNotFound(identity.to_string()));
        };

        for installed in rules {
            installed.listener.close_and_wait().await;
        }
        if let Some(session) = self.registry.get(identity).await {
            session.close().await;
        }
        info!(identity = %identity, "Client removed");
        Ok(())
    }

    /// Binds a listener for `rule` under `identity`. An empty rule id is
    /// replaced by a fresh one. Returns the installed rule.
    pub async fn add_listener(
        &self,
        identity: &str,
        mut rule: TunnelRule,
    ) -> Result<TunnelRule, ManagerError> {
        let mut clients = self.clients.lock().await;
        let rules = clients
            .get_mut(identity)
            .ok_or_else(|| ManagerError::ClientNotFound(identity.to_string()))?;

        if rule.id.is_empty() {
            rule.id = uuid::Uuid::new_v4().to_string();
        } else if rules.iter().any(|r| r.rule.id == rule.id) {
            return Err(ManagerError::RuleExists {
                identity: identity.to_string(),
                rule_id: rule.id,
            });
        }
        rule.identity = identity.to_string();

        let listener = self
            .start_listener(rule.clone(), Arc::new(IoCounters::new()))
            .await?;
        rules.push(InstalledRule {
            rule: rule.clone(),
            listener,
        });
        Ok(rule)
    }

    pub async fn remove_listener(
        &self,
        identity: &str,
        rule_id: &str,
    ) -> Result<TunnelRule, ManagerError> {
        let installed = {
            let mut clients = self.clients.lock().await;
            let rules = clients
                .get_mut(identity)
                .ok_or_else(|| ManagerError::ClientNotFound(identity.to_string()))?;
            let index = position(rules, identity, rule_id)?;
            rules.remove(index)
        };

        installed.listener.close_and_wait().await;
        info!(identity = %identity, rule_id = %rule_id, "Tunnel removed");
        Ok(installed.rule)
    }

    /// Rebinds the rule with the same id. Counters carry over. If the new
    /// rule cannot be bound the old one is restored and the error returned.
    pub async fn update_listener(
        &self,
        identity: &str,
        mut rule: TunnelRule,
    ) -> Result<TunnelRule, ManagerError> {
        let mut clients = self.clients.lock().await;
        let rules = clients
            .get_mut(identity)
            .ok_or_else(|| ManagerError::ClientNotFound(identity.to_string()))?;
        let index = position(rules, identity, &rule.id)?;
        rule.identity = identity.to_string();

        let old = rules.remove(index);
        old.listener.close_and_wait().await;
        let counters = old.listener.counters().clone();

        match self.start_listener(rule.clone(), counters.clone()).await {
            Ok(listener) => {
                rules.insert(index, InstalledRule {
                    rule: rule.clone(),
                    listener,
                });
                info!(identity = %identity, rule_id = %rule.id, "Tunnel updated");
                Ok(rule)
            }
            Err(e) => {
                warn!(identity = %identity, rule_id = %rule.id, "Tunnel update failed: {}", e);
                match self.start_listener(old.rule.clone(), counters).await {
                    Ok(listener) => rules.insert(index, InstalledRule {
                        rule: old.rule,
                        listener,
                    }),
                    Err(restore) => error!(
                        identity = %identity,
                        rule_id = %old.rule.id,
                        "Previous tunnel could not be restored: {}",
                        restore
                    ),
                }
                Err(e)
            }
        }
    }

    /// Whether `identity` belongs to the configured tunnel set
    pub async fn check_identity_registered(&self, identity: &str) -> bool {
        self.clients.lock().await.contains_key(identity)
    }

    pub async fn is_online(&self, identity: &str) -> bool {
        self.registry.is_online(identity).await
    }

    pub async fn rule_stats(
        &self,
        identity: &str,
        rule_id: &str,
    ) -> Result<CounterSnapshot, ManagerError> {
        self.with_listener(identity, rule_id, |l| l.counters().snapshot())
            .await
    }

    /// Address the rule's listener is actually bound to
    pub async fn local_addr(&self, identity: &str, rule_id: &str) -> Result<SocketAddr, ManagerError> {
        self.with_listener(identity, rule_id, |l| l.local_addr()).await
    }

    /// Client identities, sorted
    pub async fn list_clients(&self) -> Vec<String> {
        self.clients.lock().await.keys().cloned().collect()
    }

    /// Rules of `identity` in installation order
    pub async fn list_rules(&self, identity: &str) -> Result<Vec<TunnelRule>, ManagerError> {
        let clients = self.clients.lock().await;
        let rules = clients
            .get(identity)
            .ok_or_else(|| ManagerError::ClientNotFound(identity.to_string()))?;
        Ok(rules.iter().map(|r| r.rule.clone()).collect())
    }

    /// Closes every listener. Clients and rules stay registered.
    pub async fn close_all(&self) {
        let clients = self.clients.lock().await;
        for installed in clients.values().flatten() {
            installed.listener.close_and_wait().await;
        }
    }

    async fn with_listener<T>(
        &self,
        identity: &str,
        rule_id: &str,
        f: impl FnOnce(&ListenerHandle) -> T,
    ) -> Result<T, ManagerError> {
        let clients = self.clients.lock().await;
        let rules = clients
            .get(identity)
            .ok_or_else(|| ManagerError::ClientNotFound(identity.to_string()))?;
        let index = position(rules, identity, rule_id)?;
        Ok(f(&rules[index].listener))
    }

    async fn start_listener(
        &self,
        rule: TunnelRule,
        counters: Arc<IoCounters>,
    ) -> Result<ListenerHandle, ManagerError> {
        let registry = self.registry.clone();
        let keys = self.keys.clone();
        let handle = match rule.public_protocol {
            PublicProtocol::Tcp => {
                TcpTunnelServer::new(rule, registry, keys)
                    .with_counters(counters)
                    .start()
                    .await?
            }
            PublicProtocol::Udp => {
                UdpTunnelServer::new(rule, registry, keys)
                    .with_counters(counters)
                    .with_idle_timeout(self.udp_idle_timeout)
                    .start()
                    .await?
            }
        };
        Ok(handle)
    }
}

fn position(rules: &[InstalledRule], identity: &str, rule_id: &str) -> Result<usize, ManagerError> {
    rules
        .iter()
        .position(|r| r.rule.id == rule_id)
        .ok_or_else(|| ManagerError::RuleNotFound {
            identity: identity.to_string(),
            rule_id: rule_id.to_string(),
        })
}
