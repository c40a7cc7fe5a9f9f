mod api;

use std::{env, net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mailsweep_core::{
    AccessConfig, ClassificationEngine, Config, Database, DomainParser, LabelCountParser,
    OwnershipMigrator, RuleMutationEngine, RuleSetCache, init_telemetry, run_migrations,
};

/// Shared handles. The cache is the same instance for the mutation engine and
/// the classifier so a committed change is seen by the next batch.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub parser: Arc<dyn DomainParser>,
    pub cache: Arc<RuleSetCache>,
    pub access: Arc<AccessConfig>,
}

impl AppState {
    /// State with no admins and no claimable legacy owners.
    pub fn new(db: Database, parser: Arc<dyn DomainParser>, cache: Arc<RuleSetCache>) -> Self {
        Self {
            db,
            parser,
            cache,
            access: Arc::new(AccessConfig::default()),
        }
    }

    pub fn with_access(mut self, access: AccessConfig) -> Self {
        self.access = Arc::new(access);
        self
    }

    pub fn rule_engine(&self) -> RuleMutationEngine {
        RuleMutationEngine::new(self.db.clone(), self.parser.clone(), self.cache.clone())
    }

    pub fn classifier(&self) -> ClassificationEngine {
        ClassificationEngine::new(self.db.clone(), self.parser.clone(), self.cache.clone())
    }

    pub fn ownership_migrator(&self) -> OwnershipMigrator {
        OwnershipMigrator::new(
            self.db.clone(),
            self.cache.clone(),
            self.access.legacy_owner_ids.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    let _guard = init_telemetry(&config.app, &config.telemetry)?;

    let db = Database::new(&config.paths.database).await?;
    let applied = run_migrations(&db).await?;
    info!(applied, "database migrations complete");

    let cache = Arc::new(RuleSetCache::new(config.classifier.cache_ttl()));
    if !cache.is_enabled() {
        warn!("rule set cache disabled; every classification batch reloads rules");
    }
    info!(
        admins = config.access.admin_owner_ids.len(),
        legacy_owners = config.access.legacy_owner_ids.len(),
        "access lists loaded"
    );
    let state = AppState::new(db, Arc::new(LabelCountParser), cache).with_access(config.access);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(service = %config.app.service_name, "listening on {}", listener.local_addr()?);

    let shutdown = CancellationToken::new();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api::router())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    database: &'static str,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (status, health, database) = match state.db.health_check().await {
        Ok(()) => (StatusCode::OK, "healthy", "ok"),
        Err(err) => {
            warn!(error = %err, "database health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy", "unhealthy")
        }
    };

    (
        status,
        Json(HealthResponse {
            status: health,
            version: env!("CARGO_PKG_VERSION"),
            database,
        }),
    )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("received ctrl+c, shutting down"),
        _ = terminate => warn!("received terminate signal, shutting down"),
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
}
