//! Proxy lifecycle: `Idle → Enabled → Idle`, transitions driven by the
//! control API. The controller owns the dispatcher task and its shutdown
//! channel; each enable builds a fresh tunnel context.

use claudish_core::config::ConfigHandle;
use claudish_core::convstore::ConversationStore;
use claudish_core::error::ProxyError;
use claudish_core::logs::LogStore;
use claudish_core::paths::Paths;
use claudish_core::tracker::{CapturedAuth, ModelTracker};
use claudish_core::traffic::TrafficStore;
use claudish_core::usage::{PricingTable, UsageCounters};
use claudish_certs::{CertManager, PRE_GENERATE_HOSTS};
use claudish_provider::adapter::AuthContext;
use claudish_provider::oauth::OAuthManager;
use claudish_tunnel::classifier::Classifier;
use claudish_tunnel::dispatcher::{self, TunnelContext};
use claudish_tunnel::forwarder::Forwarder;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Long-lived handles shared by the control API and every tunnel.
pub struct CoreHandles {
    pub paths: Paths,
    pub config: Arc<ConfigHandle>,
    pub tracker: Arc<ModelTracker>,
    pub captured: Arc<CapturedAuth>,
    pub convstore: Arc<ConversationStore>,
    pub traffic: Arc<TrafficStore>,
    pub logs: Arc<LogStore>,
    pub certs: Arc<CertManager>,
    pub usage: Arc<UsageCounters>,
    pub pricing: Arc<PricingTable>,
    pub gemini_oauth: Arc<OAuthManager>,
    pub kimi_oauth: Arc<OAuthManager>,
    pub device_id: String,
    pub http: reqwest::Client,
}

enum State {
    Idle,
    Enabled {
        port: u16,
        shutdown: watch::Sender<bool>,
    },
}

pub struct ProxyController {
    core: Arc<CoreHandles>,
    state: tokio::sync::Mutex<State>,
}

impl ProxyController {
    pub fn new(core: Arc<CoreHandles>) -> Self {
        Self {
            core,
            state: tokio::sync::Mutex::new(State::Idle),
        }
    }

    pub fn core(&self) -> &Arc<CoreHandles> {
        &self.core
    }

    /// Start the dispatcher. Double-enable is a client error.
    pub async fn enable(&self, api_keys: HashMap<String, String>) -> Result<u16, ProxyError> {
        let mut state = self.state.lock().await;
        if matches!(*state, State::Enabled { .. }) {
            return Err(ProxyError::ProxyAlreadyRunning);
        }

        self.core.config.merge_api_keys(api_keys);

        let (listener, port) = dispatcher::bind().await?;
        let settings = self.core.config.settings();
        let ctx = Arc::new(TunnelContext {
            certs: self.core.certs.clone(),
            classifier: Classifier {
                config: self.core.config.clone(),
                tracker: self.core.tracker.clone(),
                captured: self.core.captured.clone(),
                convstore: self.core.convstore.clone(),
            },
            forwarder: Forwarder::new(settings.handshake_timeout_secs),
            traffic: self.core.traffic.clone(),
            logs: self.core.logs.clone(),
            convstore: self.core.convstore.clone(),
            config: self.core.config.clone(),
            usage: self.core.usage.clone(),
            pricing: self.core.pricing.clone(),
            auth: AuthContext {
                api_keys: self.core.config.settings().api_keys.clone(),
                gemini_oauth: Some(self.core.gemini_oauth.clone()),
                kimi_oauth: Some(self.core.kimi_oauth.clone()),
                device_id: Some(self.core.device_id.clone()),
            },
            http: self.core.http.clone(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(dispatcher::run(ctx, listener, shutdown_rx));

        let certs = self.core.certs.clone();
        tokio::spawn(async move { certs.pre_generate(PRE_GENERATE_HOSTS).await });

        self.core
            .logs
            .info("proxy", format!("dispatcher enabled on 127.0.0.1:{port}"));
        *state = State::Enabled {
            port,
            shutdown: shutdown_tx,
        };
        Ok(port)
    }

    /// Stop the dispatcher. Double-disable is a client error.
    pub async fn disable(&self) -> Result<(), ProxyError> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, State::Idle) {
            State::Enabled { shutdown, port } => {
                let _ = shutdown.send(true);
                self.core
                    .logs
                    .info("proxy", format!("dispatcher on port {port} disabled"));
                Ok(())
            }
            State::Idle => Err(ProxyError::ProxyNotRunning),
        }
    }

    pub async fn dispatcher_port(&self) -> Option<u16> {
        match *self.state.lock().await {
            State::Enabled { port, .. } => Some(port),
            State::Idle => None,
        }
    }

    pub async fn is_enabled(&self) -> bool {
        matches!(*self.state.lock().await, State::Enabled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claudish_provider::catalog::ModelCatalog;

    pub(crate) fn test_core(dir: &tempfile::TempDir) -> (Arc<CoreHandles>, Arc<ModelCatalog>) {
        let paths = Paths::with_home(dir.path());
        let core = CoreHandles {
            paths: paths.clone(),
            config: Arc::new(ConfigHandle::default()),
            tracker: Arc::new(ModelTracker::new()),
            captured: Arc::new(CapturedAuth::new()),
            convstore: Arc::new(ConversationStore::new()),
            traffic: Arc::new(TrafficStore::new()),
            logs: Arc::new(LogStore::new(paths.logs_dir())),
            certs: Arc::new(CertManager::initialize(&paths).unwrap()),
            usage: Arc::new(UsageCounters::new(paths.tokens_file(0))),
            pricing: Arc::new(PricingTable::seeded()),
            gemini_oauth: Arc::new(OAuthManager::new(
                claudish_provider::oauth::gemini_oauth_config(),
                paths.clone(),
            )),
            kimi_oauth: Arc::new(OAuthManager::new(
                claudish_provider::oauth::kimi_oauth_config(),
                paths.clone(),
            )),
            device_id: "test-device".to_string(),
            http: reqwest::Client::new(),
        };
        (Arc::new(core), Arc::new(ModelCatalog::seeded()))
    }

    #[tokio::test]
    async fn test_lifecycle_idempotence_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (core, _) = test_core(&dir);
        let controller = ProxyController::new(core);

        assert!(matches!(
            controller.disable().await,
            Err(ProxyError::ProxyNotRunning)
        ));

        let port = controller.enable(HashMap::new()).await.unwrap();
        assert!(port > 0);
        assert_eq!(controller.dispatcher_port().await, Some(port));

        assert!(matches!(
            controller.enable(HashMap::new()).await,
            Err(ProxyError::ProxyAlreadyRunning)
        ));

        controller.disable().await.unwrap();
        assert!(!controller.is_enabled().await);

        // A fresh enable binds a new port.
        let second = controller.enable(HashMap::new()).await.unwrap();
        assert!(second > 0);
        controller.disable().await.unwrap();
    }
}
