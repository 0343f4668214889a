//! Application assembly: shared handles, control API, and shutdown.

use crate::cli::RunArgs;
use claudish_core::config::ConfigHandle;
use claudish_core::convstore::ConversationStore;
use claudish_core::logs::LogStore;
use claudish_core::paths::{self, Paths};
use claudish_core::tracker::{CapturedAuth, ModelTracker};
use claudish_core::traffic::TrafficStore;
use claudish_core::usage::{PricingTable, UsageCounters};
use claudish_certs::CertManager;
use claudish_provider::catalog::ModelCatalog;
use claudish_provider::oauth::{OAuthManager, gemini_oauth_config, kimi_oauth_config};
use claudish_server::controller::{CoreHandles, ProxyController};
use claudish_server::{AppState, auth};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Application {
    state: AppState,
    control_port: Option<u16>,
}

impl Application {
    /// Build every long-lived handle. The CA must be usable or startup
    /// fails; everything else degrades at request time.
    pub fn build(args: &RunArgs) -> anyhow::Result<Self> {
        let paths = Paths::new()?;
        paths::ensure_private_dir(&paths.proxy_dir())?;
        paths::ensure_private_dir(&paths.creds_dir())?;

        let certs = Arc::new(CertManager::initialize(&paths)?);
        tracing::info!("root CA ready, fingerprint {}", certs.get_ca_fingerprint());

        let device_id = paths::load_or_create_device_id(&paths)?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        // Usage snapshots are keyed by control port; with a random port
        // the file is named after the process until the bind completes.
        let usage_path = paths.tokens_file(args.control_port.unwrap_or(0));

        let core = Arc::new(CoreHandles {
            paths: paths.clone(),
            config: Arc::new(ConfigHandle::default()),
            tracker: Arc::new(ModelTracker::new()),
            captured: Arc::new(CapturedAuth::new()),
            convstore: Arc::new(ConversationStore::new()),
            traffic: Arc::new(TrafficStore::new()),
            logs: Arc::new(LogStore::new(paths.logs_dir())),
            certs,
            usage: Arc::new(UsageCounters::new(usage_path)),
            pricing: Arc::new(PricingTable::seeded()),
            gemini_oauth: Arc::new(OAuthManager::new(gemini_oauth_config(), paths.clone())),
            kimi_oauth: Arc::new(OAuthManager::new(kimi_oauth_config(), paths.clone())),
            device_id,
            http,
        });

        let state = AppState {
            controller: Arc::new(ProxyController::new(core)),
            catalog: Arc::new(ModelCatalog::seeded()),
            token: Arc::new(auth::generate_token()),
            start_time: Instant::now(),
        };

        Ok(Self {
            state,
            control_port: args.control_port,
        })
    }

    /// Bind the control API, persist the bridge token, and serve until
    /// interrupted.
    pub async fn serve(self, enable_immediately: bool) -> anyhow::Result<()> {
        let Self {
            state,
            control_port,
        } = self;

        let addr = format!("127.0.0.1:{}", control_port.unwrap_or(0));
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        auth::write_bridge_token(&state.controller.core().paths, port, state.token.as_str())?;
        tracing::info!("control API on 127.0.0.1:{port}");

        if enable_immediately {
            let dispatcher_port = state.controller.enable(Default::default()).await?;
            tracing::info!("dispatcher on 127.0.0.1:{dispatcher_port}");
        }

        let controller = state.controller.clone();
        let router = claudish_server::build_router(state);

        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("interrupt received, shutting down");
        };

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        // Closing the control API also tears down the dispatcher.
        if controller.is_enabled().await {
            let _ = controller.disable().await;
        }
        tracing::info!("server shut down");
        Ok(())
    }
}
