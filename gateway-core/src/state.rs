//! Shared application state.
//!
//! Non-generic `AppState`, built once at startup from [`Config`] and handed
//! to every handler via axum's `State` extractor. Replaces the teacher's
//! actor-broker/connection-pool builder with direct `Arc`-held service
//! handles — there is no actor runtime in this gateway (see DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use crate::{
    agents::{BackgroundWorker, HealthRegistry},
    audit::{AuditLogger, FileAuditStorage},
    config::Config,
    error::Result,
    frontier::FrontierRouter,
    orchestrator::StreamRegistry,
    pipeline::ThreatFilter,
    quota::QuotaService,
    retrieval::{EmbeddingClient, HttpEmbeddingClient},
    sandbox::{HttpSandboxSidecar, SandboxRunner},
    session::SessionStore,
    synthesis::{HttpSynthesisBackend, SynthesisBackend},
    vector_store::VectorStore,
};

/// Health state for the local backend HTTP client (spec.md §4.2: chat/embed
/// endpoint, marked unhealthy after N consecutive failures).
#[derive(Debug, Default)]
pub struct BackendHealth {
    consecutive_failures: std::sync::atomic::AtomicU32,
}

impl BackendHealth {
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1
    }

    pub fn is_healthy(&self, threshold: u32) -> bool {
        self.consecutive_failures.load(std::sync::atomic::Ordering::SeqCst) < threshold
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    audit: Arc<AuditLogger>,
    quota: Arc<QuotaService>,
    sessions: Arc<SessionStore>,
    vectors: Arc<VectorStore>,
    backend_client: reqwest::Client,
    backend_health: Arc<BackendHealth>,
    frontier: Arc<FrontierRouter>,
    embedder: Arc<dyn EmbeddingClient>,
    synthesis_backend: Arc<dyn SynthesisBackend>,
    sandbox: Arc<SandboxRunner>,
    stream_registry: Arc<StreamRegistry>,
    threat_filter: Arc<ThreatFilter>,
    health: Arc<HealthRegistry>,
    background: Arc<BackgroundWorker>,
    jwt_auth: Option<Arc<crate::middleware::JwtAuth>>,
}

impl AppState {
    /// Construct the full application state from configuration, wiring
    /// every service's filesystem root under `config.data.root`.
    pub async fn build(config: Config) -> Result<Self> {
        let signing_key = load_or_none_signing_key(&config)?;

        let audit_storage = Arc::new(FileAuditStorage::new(config.data.audit_dir()));
        let audit = Arc::new(AuditLogger::load(audit_storage, config.audit.clone(), signing_key).await?);

        let quota = Arc::new(QuotaService::new(config.data.root.join("quota"), config.tiers.clone(), config.guest.clone()));
        let sessions = Arc::new(SessionStore::new(config.data.sessions_dir(), config.session.clone()));
        let vectors = Arc::new(VectorStore::new(config.data.vectors_dir()));

        let backend_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.backend.timeout_secs))
            .build()
            .map_err(|e| crate::error::Error::Internal(format!("failed to build backend HTTP client: {e}")))?;

        let embedder: Arc<dyn EmbeddingClient> =
            Arc::new(HttpEmbeddingClient::new(backend_client.clone(), config.backend.embed_url.clone()));
        let synthesis_backend: Arc<dyn SynthesisBackend> =
            Arc::new(HttpSynthesisBackend::new(backend_client.clone(), config.backend.chat_url.clone()));
        let frontier = Arc::new(FrontierRouter::new(config.frontier.clone()));
        let sidecar = Arc::new(HttpSandboxSidecar::new(backend_client.clone(), config.sandbox.sidecar_url.clone()));
        let sandbox = Arc::new(SandboxRunner::new(config.sandbox.clone(), config.data.root.join("sandboxes"), sidecar));

        let jwt_auth = if config.jwt.enabled {
            match crate::middleware::JwtAuth::new(&config.jwt) {
                Ok(auth) => Some(Arc::new(auth)),
                Err(e) => {
                    tracing::warn!(error = %e, "legacy JWT auth disabled: failed to load public key");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            config: Arc::new(config),
            audit,
            quota,
            sessions,
            vectors,
            backend_client,
            backend_health: Arc::new(BackendHealth::default()),
            frontier,
            embedder,
            synthesis_backend,
            sandbox,
            stream_registry: Arc::new(StreamRegistry::new()),
            threat_filter: Arc::new(ThreatFilter::default()),
            health: Arc::new(HealthRegistry::new()),
            background: Arc::new(BackgroundWorker::new()),
            jwt_auth,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn quota(&self) -> &Arc<QuotaService> {
        &self.quota
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn vectors(&self) -> &Arc<VectorStore> {
        &self.vectors
    }

    pub fn backend_client(&self) -> &reqwest::Client {
        &self.backend_client
    }

    pub fn backend_health(&self) -> &Arc<BackendHealth> {
        &self.backend_health
    }

    pub fn frontier(&self) -> &Arc<FrontierRouter> {
        &self.frontier
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingClient> {
        &self.embedder
    }

    pub fn synthesis_backend(&self) -> &Arc<dyn SynthesisBackend> {
        &self.synthesis_backend
    }

    pub fn sandbox(&self) -> &Arc<SandboxRunner> {
        &self.sandbox
    }

    pub fn stream_registry(&self) -> &Arc<StreamRegistry> {
        &self.stream_registry
    }

    pub fn threat_filter(&self) -> &Arc<ThreatFilter> {
        &self.threat_filter
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn background(&self) -> &Arc<BackgroundWorker> {
        &self.background
    }

    pub fn jwt_auth(&self) -> Option<&Arc<crate::middleware::JwtAuth>> {
        self.jwt_auth.as_ref()
    }
}

fn load_or_none_signing_key(config: &Config) -> Result<Option<ed25519_dalek::SigningKey>> {
    let Some(path) = &config.audit.signing_key_path else { return Ok(None) };
    if !path.exists() {
        tracing::warn!(path = %path.display(), "audit signing key not found, falling back to HMAC");
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    let key_bytes: [u8; 32] = bytes
        .get(..32)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| crate::error::Error::Internal("audit signing key must be 32 raw bytes".into()))?;
    Ok(Some(ed25519_dalek::SigningKey::from_bytes(&key_bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_with_default_config_in_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data.root = dir.path().to_path_buf();

        let state = AppState::build(config).await.unwrap();
        assert_eq!(state.config().service.port, 8080);
    }

    #[test]
    fn backend_health_tracks_consecutive_failures() {
        let health = BackendHealth::default();
        assert!(health.is_healthy(3));
        health.record_failure();
        health.record_failure();
        assert!(health.is_healthy(3));
        health.record_failure();
        assert!(!health.is_healthy(3));
        health.record_success();
        assert!(health.is_healthy(3));
    }
}
