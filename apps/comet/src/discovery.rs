//! Service-directory registration so the logic tier can find this node, and
//! the renewal loop that keeps its load metadata current.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::gateway::Server;

pub const APP_ID: &str = "goim.comet";

#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("directory rejected {action}: code {code}, {message}")]
    Rejected {
        action: &'static str,
        code: i64,
        message: String,
    },
    #[error("not registered")]
    NotRegistered,
}

/// What this node publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub region: String,
    pub zone: String,
    pub env: String,
    pub app_id: String,
    pub hostname: String,
    pub addrs: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Instance {
    pub fn from_config(config: &Config, addrs: Vec<String>) -> Self {
        let d = &config.discovery;
        let mut metadata = BTreeMap::new();
        metadata.insert("weight".to_string(), d.weight.to_string());
        metadata.insert("offline".to_string(), "false".to_string());
        metadata.insert("conns".to_string(), "0".to_string());
        metadata.insert("ips".to_string(), "0".to_string());
        metadata.insert("ip_addrs".to_string(), d.ip_addrs.join(","));
        Self {
            region: d.region.clone(),
            zone: d.zone.clone(),
            env: d.env.clone(),
            app_id: APP_ID.to_string(),
            hostname: d.hostname.clone(),
            addrs,
            metadata,
        }
    }

    /// Refresh the load figures the directory uses for placement.
    pub fn update_load(&mut self, conns: usize, ips: usize) {
        self.metadata.insert("conns".to_string(), conns.to_string());
        self.metadata.insert("ips".to_string(), ips.to_string());
    }
}

#[async_trait]
pub trait Discovery: Send + Sync {
    async fn register(&self, instance: &Instance) -> Result<(), DiscoveryError>;
    async fn renew(&self, instance: &Instance) -> Result<(), DiscoveryError>;
    async fn cancel(&self) -> Result<(), DiscoveryError>;
}

/// Used when no directory is configured.
pub struct NoopDiscovery;

#[async_trait]
impl Discovery for NoopDiscovery {
    async fn register(&self, _instance: &Instance) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn renew(&self, _instance: &Instance) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn cancel(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DirectoryResponse {
    code: i64,
    #[serde(default)]
    message: String,
}

/// Form-encoded client for a discovery directory node.
pub struct HttpDiscovery {
    base_url: String,
    http: reqwest::Client,
    registered: Mutex<Option<Instance>>,
}

impl HttpDiscovery {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            registered: Mutex::new(None),
        }
    }

    async fn post(
        &self,
        action: &'static str,
        form: &[(&str, String)],
    ) -> Result<(), DiscoveryError> {
        let url = format!("{}/discovery/{action}", self.base_url);
        let resp: DirectoryResponse = self
            .http
            .post(&url)
            .form(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if resp.code != 0 {
            return Err(DiscoveryError::Rejected {
                action,
                code: resp.code,
                message: resp.message,
            });
        }
        Ok(())
    }

    fn identity_form(instance: &Instance) -> Vec<(&'static str, String)> {
        vec![
            ("region", instance.region.clone()),
            ("zone", instance.zone.clone()),
            ("env", instance.env.clone()),
            ("appid", instance.app_id.clone()),
            ("hostname", instance.hostname.clone()),
        ]
    }

    fn metadata_json(instance: &Instance) -> String {
        serde_json::to_string(&instance.metadata).unwrap_or_else(|_| "{}".to_string())
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn register(&self, instance: &Instance) -> Result<(), DiscoveryError> {
        let mut form = Self::identity_form(instance);
        form.push(("addrs", instance.addrs.join(",")));
        form.push(("status", "1".to_string()));
        form.push(("metadata", Self::metadata_json(instance)));
        self.post("register", &form).await?;
        *self.registered.lock() = Some(instance.clone());
        tracing::info!(hostname = %instance.hostname, addrs = ?instance.addrs, "registered with discovery");
        Ok(())
    }

    async fn renew(&self, instance: &Instance) -> Result<(), DiscoveryError> {
        let mut form = Self::identity_form(instance);
        form.push(("metadata", Self::metadata_json(instance)));
        self.post("set", &form).await
    }

    async fn cancel(&self) -> Result<(), DiscoveryError> {
        let Some(instance) = self.registered.lock().take() else {
            return Err(DiscoveryError::NotRegistered);
        };
        self.post("cancel", &Self::identity_form(&instance)).await?;
        tracing::info!(hostname = %instance.hostname, "discovery registration cancelled");
        Ok(())
    }
}

/// Republish `conns` and `ips` every `tick` until `shutdown` fires.
pub async fn run(
    server: Arc<Server>,
    discovery: Arc<dyn Discovery>,
    mut instance: Instance,
    tick: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let conns = server.channel_count();
        let ips = server.ips().len();
        instance.update_load(conns, ips);
        if let Err(e) = discovery.renew(&instance).await {
            tracing::warn!(error = %e, "discovery renewal failed");
        } else {
            tracing::debug!(conns, ips, "discovery metadata renewed");
        }
    }
    tracing::debug!("discovery renewal stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> Instance {
        let mut metadata = BTreeMap::new();
        metadata.insert("weight".to_string(), "10".to_string());
        Instance {
            region: "sh".into(),
            zone: "sh001".into(),
            env: "dev".into(),
            app_id: APP_ID.into(),
            hostname: "comet-1".into(),
            addrs: vec!["tcp://10.0.0.1:3101".into()],
            metadata,
        }
    }

    #[test]
    fn update_load_overwrites_metadata() {
        let mut instance = instance();
        instance.update_load(12, 3);
        instance.update_load(15, 4);
        assert_eq!(instance.metadata.get("conns").map(String::as_str), Some("15"));
        assert_eq!(instance.metadata.get("ips").map(String::as_str), Some("4"));
        assert_eq!(instance.metadata.get("weight").map(String::as_str), Some("10"));
    }

    #[test]
    fn from_config_publishes_ip_addrs() {
        let mut config = crate::config::Config {
            tcp_bind: "127.0.0.1:3101".parse().unwrap(),
            ws_bind: "127.0.0.1:3102".parse().unwrap(),
            wss_bind: None,
            tls_cert: None,
            tls_key: None,
            control_bind: "127.0.0.1:3109".parse().unwrap(),
            jwt_secret: "secret".into(),
            gateway: Default::default(),
            whitelist: Vec::new(),
            discovery: crate::config::DiscoveryConfig {
                url: None,
                server_tick: Duration::from_secs(10),
                region: "sh".into(),
                zone: "sh001".into(),
                env: "dev".into(),
                hostname: "comet-1".into(),
                weight: 10,
                ip_addrs: vec!["10.0.0.1".into(), "203.0.113.7".into()],
            },
        };
        let instance = Instance::from_config(&config, vec!["tcp://10.0.0.1:3101".into()]);
        assert_eq!(
            instance.metadata.get("ip_addrs").map(String::as_str),
            Some("10.0.0.1,203.0.113.7")
        );

        config.discovery.ip_addrs.clear();
        let instance = Instance::from_config(&config, Vec::new());
        assert_eq!(instance.metadata.get("ip_addrs").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn cancel_before_register_is_an_error() {
        let discovery = HttpDiscovery::new("http://127.0.0.1:9/");
        assert!(matches!(
            discovery.cancel().await,
            Err(DiscoveryError::NotRegistered)
        ));
    }
}
