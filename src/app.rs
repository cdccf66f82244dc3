use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::api::client::{ApiClient, ChatBackend};
use crate::bus::{EventBus, ReconnectPolicy, Subscription};
use crate::error::Result;
use crate::identity::{ConversationFrequency, IdentityChain, ProfileLookup, TokenClaims};
use crate::storage::ConversationCache;
use crate::sync::{ConversationSync, SyncPolicy};

fn default_ws_path() -> String {
    "/ws".into()
}

fn default_refresh_delay_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default = "default_refresh_delay_ms")]
    pub summary_refresh_delay_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub rollback_on_send_failure: bool,
    #[serde(default)]
    pub cancel_stale_loads: bool,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            ws_path: default_ws_path(),
            summary_refresh_delay_ms: default_refresh_delay_ms(),
            reconnect: ReconnectPolicy::default(),
            rollback_on_send_failure: false,
            cancel_stale_loads: false,
            cache_enabled: true,
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }
    // TOML is the primary format; an older JSON state file is migrated on first read.
    fn toml_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join("murmur.toml"))
    }

    fn legacy_json_path() -> Option<PathBuf> {
        let proj = directories::ProjectDirs::from("com", "example", "Murmur")?;
        Some(proj.config_dir().join("state.json"))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn load() -> Self {
        if let Some(path) = Self::toml_path() {
            if path.exists() {
                match Self::load_from(&path) {
                    Ok(config) => return config,
                    Err(e) => log::warn!("ignoring unreadable config {}: {e}", path.display()),
                }
            }
        }

        if let Some(legacy) = Self::legacy_json_path() {
            if let Ok(bytes) = fs::read(&legacy) {
                if let Ok(config) = serde_json::from_slice::<AppConfig>(&bytes) {
                    if let Err(e) = config.save() {
                        log::warn!("could not migrate legacy config: {e}");
                    }
                    return config;
                }
            }
        }

        Self::new()
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        match Self::toml_path() {
            Some(path) => self.save_to(&path),
            None => Err(std::io::Error::new(std::io::ErrorKind::NotFound, "No config dir").into()),
        }
    }

    pub fn websocket_url(&self) -> Result<Url> {
        crate::utils::websocket_url(&self.base_url, &self.ws_path)
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy {
            summary_refresh_delay: Duration::from_millis(self.summary_refresh_delay_ms),
            rollback_on_send_failure: self.rollback_on_send_failure,
            cancel_stale_loads: self.cancel_stale_loads,
        }
    }
}

/// Everything a page session needs, wired once at startup.
pub struct App {
    pub config: AppConfig,
    pub bus: EventBus,
    pub sync: ConversationSync,
    subscriptions: Vec<Subscription>,
}

impl App {
    pub async fn start(config: AppConfig) -> Result<Self> {
        let backend: Arc<dyn ChatBackend> =
            Arc::new(ApiClient::new(&crate::utils::normalize_url(&config.base_url), config.token.clone()));
        let bus = EventBus::with_reconnect(config.websocket_url()?, config.reconnect);

        let mut identity = IdentityChain::new();
        if let Some(token) = config.token.as_deref() {
            identity = identity.with(TokenClaims::new(token));
        }
        let identity = identity
            .with(ProfileLookup::new(Arc::clone(&backend)))
            .with(ConversationFrequency::new(Arc::clone(&backend)));

        let mut sync = ConversationSync::new(
            backend,
            Arc::new(bus.clone()),
            Arc::new(identity),
            config.sync_policy(),
        );
        if config.cache_enabled {
            match ConversationCache::open_default() {
                Ok(cache) => sync = sync.with_cache(Arc::new(cache)),
                Err(e) => log::warn!("conversation cache unavailable: {e}"),
            }
        }

        let subscriptions = sync.attach(&bus);
        if let Err(e) = bus.connect().await {
            log::error!("realtime connection unavailable, continuing without it: {e}");
        }

        sync.warm_from_cache();
        if let Err(e) = sync.refresh_conversations().await {
            log::warn!("initial conversation load failed: {e}");
        }

        Ok(Self { config, bus, sync, subscriptions })
    }

    pub fn shutdown(&mut self) {
        for sub in self.subscriptions.drain(..) {
            sub.unsubscribe();
        }
        self.bus.disconnect();
    }
}
