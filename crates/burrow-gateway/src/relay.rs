//! Relay application facade
//!
//! Wires the key store, session registry, listener manager and gateway
//! together from a [`GatewayConfig`], and is what the binary and the admin
//! API talk to. The configured client set is the manager's state; saving the
//! config writes that state back to the file it was loaded from.

use burrow_control::{CounterSnapshot, KeyStore, SessionRegistry, DEFAULT_UDP_IDLE_TIMEOUT};
use burrow_proto::TunnelRule;
use burrow_transport_yamux::YamuxMultiplexer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{ClientConfig, ConfigError, GatewayConfig, ListenerConfig};
use crate::gateway::{Gateway, GatewayError};
use crate::manager::{ListenerManager, ManagerError};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("relay is already running")]
    AlreadyStarted,
}

pub struct Relay {
    config: GatewayConfig,
    config_path: Option<PathBuf>,
    registry: SessionRegistry,
    keys: Arc<KeyStore>,
    manager: Arc<ListenerManager>,
    gateway: Mutex<Option<Gateway>>,
}

impl Relay {
    /// `config_path` is where [`Relay::save_config`] writes; `None` keeps
    /// all changes in memory.
    pub fn new(config: GatewayConfig, config_path: Option<PathBuf>) -> Self {
        let keys = Arc::new(match &config.key_dir {
            Some(dir) => KeyStore::with_key_dir(dir),
            None => KeyStore::new(),
        });
        let registry = SessionRegistry::new(Arc::new(YamuxMultiplexer::default()));
        let manager = Arc::new(ListenerManager::new(registry.clone(), keys.clone()));

        Self {
            config,
            config_path,
            registry,
            keys,
            manager,
            gateway: Mutex::new(None),
        }
    }

    /// Shortens or lengthens the UDP pseudo-session window. Call before
    /// [`Relay::start`].
    pub fn with_udp_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        if idle_timeout != DEFAULT_UDP_IDLE_TIMEOUT {
            self.manager = Arc::new(
                ListenerManager::new(self.registry.clone(), self.keys.clone())
                    .with_udp_idle_timeout(idle_timeout),
            );
        }
        self
    }

    /// Binds the gateway, then installs every configured client and rule.
    pub async fn start(&self) -> Result<SocketAddr, RelayError> {
        let mut gateway = self.gateway.lock().await;
        if gateway.is_some() {
            return Err(RelayError::AlreadyStarted);
        }

        let started = Gateway::start(
            &self.config.gateway_addr(),
            self.manager.clone(),
            self.config.gateway.debug_info,
        )
        .await?;
        let addr = started.local_addr();
        *gateway = Some(started);
        drop(gateway);

        for client in &self.config.clients {
            self.manager.add_client(&client.identity).await?;
            for listener in &client.listeners {
                let rule = self
                    .manager
                    .add_listener(&client.identity, listener.to_rule(&client.identity))
                    .await?;
                debug!(identity = %client.identity, rule_id = %rule.id, "Installed configured tunnel");
            }
        }

        info!(clients = self.config.clients.len(), "Relay started");
        Ok(addr)
    }

    pub async fn gateway_addr(&self) -> Option<SocketAddr> {
        self.gateway.lock().await.as_ref().map(Gateway::local_addr)
    }

    pub fn manager(&self) -> &Arc<ListenerManager> {
        &self.manager
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn add_client(&self, identity: &str) -> Result<(), RelayError> {
        Ok(self.manager.add_client(identity).await?)
    }

    pub async fn remove_client(&self, identity: &str) -> Result<(), RelayError> {
        Ok(self.manager.remove_client(identity).await?)
    }

    pub async fn clients(&self) -> Vec<String> {
        self.manager.list_clients().await
    }

    pub async fn tunnels(&self, identity: &str) -> Result<Vec<TunnelRule>, RelayError> {
        Ok(self.manager.list_rules(identity).await?)
    }

    pub async fn add_tunnel(
        &self,
        identity: &str,
        listener: &ListenerConfig,
    ) -> Result<TunnelRule, RelayError> {
        Ok(self
            .manager
            .add_listener(identity, listener.to_rule(identity))
            .await?)
    }

    pub async fn update_tunnel(
        &self,
        identity: &str,
        rule_id: &str,
        listener: &ListenerConfig,
    ) -> Result<TunnelRule, RelayError> {
        let mut rule = listener.to_rule(identity);
        rule.id = rule_id.to_string();
        Ok(self.manager.update_listener(identity, rule).await?)
    }

    pub async fn remove_tunnel(&self, identity: &str, rule_id: &str) -> Result<TunnelRule, RelayError> {
        Ok(self.manager.remove_listener(identity, rule_id).await?)
    }

    pub async fn tunnel_stats(
        &self,
        identity: &str,
        rule_id: &str,
    ) -> Result<CounterSnapshot, RelayError> {
        Ok(self.manager.rule_stats(identity, rule_id).await?)
    }

    pub async fn is_online(&self, identity: &str) -> bool {
        self.manager.is_online(identity).await
    }

    /// Base64 key an agent needs for encrypted rules
    pub async fn key_for(&self, identity: &str) -> Result<String, RelayError> {
        if !self.manager.check_identity_registered(identity).await {
            return Err(ManagerError::ClientNotFound(identity.to_string()).into());
        }
        Ok(self.keys.provision(identity).await.to_base64())
    }

    /// Static sections from the loaded file plus the current client set
    pub async fn current_config(&self) -> GatewayConfig {
        let mut clients = Vec::new();
        for identity in self.manager.list_clients().await {
            // A client removed concurrently simply drops out
            let Ok(rules) = self.manager.list_rules(&identity).await else {
                continue;
            };
            clients.push(ClientConfig {
                identity,
                listeners: rules.iter().map(ListenerConfig::from).collect(),
            });
        }

        GatewayConfig {
            clients,
            ..self.config.clone()
        }
    }

    pub async fn save_config(&self) -> Result<(), RelayError> {
        let Some(path) = &self.config_path else {
            debug!("No config path, skipping save");
            return Ok(());
        };
        self.current_config().await.save(path)?;
        info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Stops the gateway, every listener, and every agent session.
    pub async fn shutdown(&self) {
        if let Some(gateway) = self.gateway.lock().await.take() {
            gateway.close();
        }
        self.manager.close_all().await;
        self.registry.close_all().await;
        info!("Relay stopped");
    }
}
