//! Route registration and handler bodies for the HTTP surface (spec.md §4.11,
//! §6). Thin handlers that validate input and delegate to the subsystem
//! modules — the orchestrator carries the one genuinely complex handler.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEntry, AuditResult};
use crate::capability::{tier_rank, CapabilityRouter, DeviceHints, InfraSignals};
use crate::connectors::{FileConnector, ReadScopeTable};
use crate::error::{Error, Result};
use crate::middleware::extract_token;
use crate::orchestrator::{ChatRequest, OrchestratorDeps};
use crate::pipeline::ChatMessage;
use crate::quota::QuotaAction;
use crate::retrieval::RetrievalLayer;
use crate::sandbox::allowed_artifact_mime;
use crate::session::{OptionalSession, TypedSession};

use crate::state::AppState;
use crate::vector_store::Namespace;

/// Strip directory components and control characters from a client-supplied
/// filename, keeping only the base name (spec.md §6 `/api/files/upload`).
fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "upload.bin".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Resolved caller identity: session cookie → legacy bearer token → anonymous
/// guest (spec.md §4.3 auth waterfall).
pub struct Caller {
    pub user_id: String,
    pub tier: String,
    pub is_guest: bool,
}

async fn resolve_caller(state: &AppState, headers: &HeaderMap, session: OptionalSession) -> Caller {
    if let Some(record) = session.0 {
        return Caller {
            user_id: record.user_id.clone().unwrap_or_else(|| record.id.clone()),
            tier: record.tier,
            is_guest: false,
        };
    }

    if let Some(auth) = state.jwt_auth() {
        if let Ok(token) = extract_token(headers) {
            if let Ok(claims) = auth.validate(&token) {
                let tier = claims.roles.first().cloned().unwrap_or_else(|| "free".to_string());
                return Caller { user_id: claims.sub, tier, is_guest: false };
            }
        }
    }

    Caller { user_id: "guest".to_string(), tier: "free".to_string(), is_guest: true }
}

fn guest_fingerprint(headers: &HeaderMap) -> String {
    let ua = headers.get("user-agent").and_then(|v| v.to_str().ok()).unwrap_or("unknown");
    let xff = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()).unwrap_or("unknown");
    format!("{ua}:{xff}")
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub power_dial: Option<String>,
}

const DEFAULT_POWER_DIAL: &str = "instant";

/// `POST /api/stream` (spec.md §6, §4.7).
pub async fn stream_chat(State(state): State<AppState>, headers: HeaderMap, session: OptionalSession, Json(body): Json<ChatBody>) -> impl IntoResponse {
    let caller = resolve_caller(&state, &headers, session).await;
    let fingerprint = guest_fingerprint(&headers);
    let session_id = body.session_id.unwrap_or_else(|| crate::ids::prefixed_id("sess"));

    let requested_profile = body.power_dial.clone().unwrap_or_else(|| DEFAULT_POWER_DIAL.to_string());
    let capability_router = CapabilityRouter::new(&state.config().capability);
    let infra = InfraSignals {
        thermal_throttled: false,
        backend_degraded: !state.backend_health().is_healthy(state.config().backend.unhealthy_threshold),
    };
    let resolved = capability_router.resolve(&requested_profile, &caller.tier, &DeviceHints::default(), &infra);

    let deps = OrchestratorDeps {
        audit: state.audit().clone(),
        quota: state.quota().clone(),
        vectors: state.vectors().clone(),
        embedder: state.embedder().clone(),
        frontier: state.frontier().clone(),
        synthesis_backend: Some(state.synthesis_backend().clone()),
        synthesis_config: state.config().synthesis.clone(),
        registry: state.stream_registry().clone(),
        threat_filter: state.threat_filter().clone(),
        backend: Arc::new(crate::orchestrator::HttpChatBackend::new(
            state.backend_client().clone(),
            state.config().backend.chat_url.clone(),
        )),
    };

    let request = ChatRequest {
        session_id,
        user_id: caller.user_id,
        tier: caller.tier,
        is_guest: caller.is_guest,
        guest_fingerprint: Some(fingerprint),
        messages: body.messages,
        requested_profile,
        policy: resolved.policy,
        capability_summary: resolved.summary,
    };

    crate::orchestrator::run_stream(request, deps)
}

#[derive(Debug, Deserialize)]
pub struct RagQuery {
    pub namespace: String,
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
}

fn default_top_k() -> u32 {
    5
}

/// `POST /api/rag/query` (spec.md §6).
pub async fn rag_query(State(state): State<AppState>, session: TypedSession, Json(body): Json<RagQuery>) -> Result<impl IntoResponse> {
    let namespace = Namespace::parse(&body.namespace)?;
    let user_id = session.0.user_id.clone().unwrap_or(session.0.id.clone());
    let layer = RetrievalLayer::with_audit(state.vectors(), state.embedder().as_ref(), state.audit());
    let results = layer.retrieve(&user_id, namespace, &body.query, body.top_k, 0.0).await?;
    Ok(Json(results))
}

/// `GET /api/rag/stats?namespace=edubba` (spec.md §6).
pub async fn rag_stats(State(state): State<AppState>, session: TypedSession, Query(params): Query<std::collections::HashMap<String, String>>) -> Result<impl IntoResponse> {
    let namespace = Namespace::parse(params.get("namespace").map(String::as_str).unwrap_or("edubba"))?;
    let user_id = session.0.user_id.clone().unwrap_or(session.0.id.clone());
    let count = state.vectors().count(&user_id, namespace).await?;
    Ok(Json(serde_json::json!({ "count": count })))
}

/// `POST /api/rag/clear` (spec.md §6).
pub async fn rag_clear(State(state): State<AppState>, session: TypedSession, Json(body): Json<RagQuery>) -> Result<impl IntoResponse> {
    let namespace = Namespace::parse(&body.namespace)?;
    let user_id = session.0.user_id.clone().unwrap_or(session.0.id.clone());
    state.vectors().clear(&user_id, namespace).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct EmbedBody {
    pub text: String,
}

/// `POST /api/embed` (spec.md §6).
pub async fn embed(State(state): State<AppState>, Json(body): Json<EmbedBody>) -> Result<impl IntoResponse> {
    let embedding = state.embedder().embed(&body.text).await?;
    Ok(Json(serde_json::json!({ "embedding": embedding })))
}

#[derive(Debug, Deserialize)]
pub struct IngestBody {
    pub namespace: String,
    pub file_id: String,
    pub chunks: Vec<String>,
}

/// `POST /api/ingest` (spec.md §6, §4.6).
pub async fn ingest(State(state): State<AppState>, session: TypedSession, Json(body): Json<IngestBody>) -> Result<impl IntoResponse> {
    let namespace = Namespace::parse(&body.namespace)?;
    let user_id = session.0.user_id.clone().unwrap_or(session.0.id.clone());
    let layer = RetrievalLayer::with_audit(state.vectors(), state.embedder().as_ref(), state.audit());
    let count = layer.ingest(&user_id, namespace, &body.file_id, body.chunks).await?;
    Ok(Json(serde_json::json!({ "ingested": count })))
}

/// `POST /api/files/upload` — raw body, `X-Filename` header (spec.md §6).
/// Path resolution outside the per-user uploads root is a validation error
/// logged as `UPLOAD_TRAVERSAL` rather than a generic `403`.
pub async fn files_upload(State(state): State<AppState>, session: TypedSession, headers: HeaderMap, body: Bytes) -> Result<impl IntoResponse> {
    let user_id = session.0.user_id.clone().unwrap_or(session.0.id.clone());
    let filename = headers
        .get("x-filename")
        .and_then(|v| v.to_str().ok())
        .map(sanitize_filename)
        .unwrap_or_else(|| "upload.bin".to_string());

    let connector = FileConnector::new(state.config().data.uploads_dir(), "audit", ReadScopeTable::default());
    let relative = format!("{user_id}/{filename}");
    match connector.write(&relative, &body).await {
        Ok(record) => Ok(Json(serde_json::json!({ "path": record.path, "bytes": record.bytes, "sha256": record.sha256 }))),
        Err(Error::PathTraversal(msg)) => {
            let _ = state
                .audit()
                .log(AuditEntry::new("files", "UPLOAD_TRAVERSAL", AuditResult::Denied).with_user_id(&user_id).with_meta(serde_json::json!({ "reason": msg })))
                .await;
            Err(Error::PathTraversal(msg))
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Serialize)]
pub struct CapabilityProfilesResponse {
    profiles: Vec<String>,
}

/// `GET /api/capability/profiles` (spec.md §6).
pub async fn capability_profiles(State(state): State<AppState>) -> impl IntoResponse {
    let profiles = state.config().capability.profiles.keys().cloned().collect();
    Json(CapabilityProfilesResponse { profiles })
}

#[derive(Debug, Deserialize)]
pub struct NegotiateBody {
    pub power_dial: String,
    #[serde(default)]
    pub device_max_context_tokens: Option<u32>,
}

/// `POST /api/capability/negotiate` (spec.md §4.5, §6).
pub async fn capability_negotiate(State(state): State<AppState>, session: TypedSession, Json(body): Json<NegotiateBody>) -> impl IntoResponse {
    let router = CapabilityRouter::new(&state.config().capability);
    let device = DeviceHints { max_context_tokens: body.device_max_context_tokens };
    let infra = InfraSignals {
        thermal_throttled: false,
        backend_degraded: !state.backend_health().is_healthy(state.config().backend.unhealthy_threshold),
    };
    let resolved = router.resolve(&body.power_dial, &session.0.tier, &device, &infra);
    Json(resolved.summary)
}

/// `GET /api/frontier/status` (spec.md §6, §4.9).
pub async fn frontier_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "enabled": state.frontier().config().enabled }))
}

#[derive(Debug, Serialize)]
struct QuotaResponse {
    chat: crate::quota::QuotaStatus,
}

/// `GET /api/quota/status` — surfaces current quota usage to the client.
pub async fn quota_status(State(state): State<AppState>, session: TypedSession) -> impl IntoResponse {
    let user_id = session.0.user_id.clone().unwrap_or(session.0.id.clone());
    let status = state.quota().check_quota(&user_id, &session.0.tier, QuotaAction::Chat);
    Json(QuotaResponse { chat: status })
}

/// `GET /api/audit/recent?limit=50` (spec.md §6).
pub async fn audit_recent(State(state): State<AppState>, Query(params): Query<std::collections::HashMap<String, String>>) -> Result<impl IntoResponse> {
    let limit = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(50);
    let entries = state.audit().recent(limit).await?;
    Ok(Json(entries))
}

/// `POST /api/audit/seal` (spec.md §6) — seals today's chain, fixing the head.
pub async fn audit_seal(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.audit().seal_day(chrono::Utc::now().date_naive()).await?;
    Ok(Json(serde_json::json!({ "sealed": true })))
}

/// `GET /api/audit/verify?date=2026-07-29` (spec.md §6) — returns a
/// structured report rather than a bare success/error, since a tampered
/// chain is an expected response shape, not a server fault.
pub async fn audit_verify(State(state): State<AppState>, Query(params): Query<std::collections::HashMap<String, String>>) -> Result<impl IntoResponse> {
    let date = params
        .get("date")
        .and_then(|v| chrono::NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
        .unwrap_or_else(|| chrono::Utc::now().date_naive());
    let report = state.audit().verify(date).await?;
    Ok(Json(report))
}

/// `GET /api/audit/verify/all` (spec.md §4.1 `verifyAll`) — walks every day
/// file in chronological order, stopping at the first break.
pub async fn audit_verify_all(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let report = state.audit().verify_all().await?;
    Ok(Json(report))
}

/// `GET /api/health` (spec.md §6).
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health().aggregate())
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceBody {
    pub name: String,
}

/// Sandbox access is gated at `pro` and above regardless of whether the
/// sidecar feature is globally enabled (spec.md scenario S2: `free` and
/// unauthenticated callers both get `sandbox_disabled`).
const SANDBOX_MIN_TIER: &str = "pro";

/// `POST /api/sandbox/workspaces` (spec.md §4.10, §6).
pub async fn sandbox_create_workspace(
    State(state): State<AppState>,
    headers: HeaderMap,
    session: OptionalSession,
    Json(body): Json<CreateWorkspaceBody>,
) -> Result<impl IntoResponse> {
    let caller = resolve_caller(&state, &headers, session).await;
    if tier_rank(&caller.tier) < tier_rank(SANDBOX_MIN_TIER) {
        return Err(Error::PolicyBlocked("sandbox_disabled".into()));
    }
    let workspace = state.sandbox().create_workspace(&caller.user_id, &body.name).await?;
    Ok(Json(workspace))
}

#[derive(Debug, Deserialize)]
pub struct RunBody {
    pub workspace_id: String,
    pub entrypoint: String,
}

/// `POST /api/sandbox/run` (spec.md §4.10, §6).
pub async fn sandbox_run(State(state): State<AppState>, session: TypedSession, Json(body): Json<RunBody>) -> Result<impl IntoResponse> {
    let user_id = session.0.user_id.clone().unwrap_or(session.0.id.clone());
    let tier_limits = state.config().tiers.for_tier(&session.0.tier);
    let run = state.sandbox().enqueue_run(&user_id, &body.workspace_id, &body.entrypoint, tier_limits.max_concurrent as u32).await?;
    Ok(Json(run))
}

/// `GET /api/sandbox/run/{runId}` (spec.md §4.10, §6).
pub async fn sandbox_run_status(State(state): State<AppState>, AxumPath(run_id): AxumPath<String>) -> Result<impl IntoResponse> {
    let run = state.sandbox().get_run(&run_id).ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
    Ok(Json(run))
}

#[derive(Debug, Deserialize)]
pub struct SandboxWriteBody {
    pub workspace_id: String,
    pub path: String,
    pub content: String,
}

/// `POST /api/sandbox/files/write` (spec.md §4.10, §6) — UTF-8 text write.
pub async fn sandbox_files_write(State(state): State<AppState>, session: TypedSession, Json(body): Json<SandboxWriteBody>) -> Result<impl IntoResponse> {
    let user_id = session.0.user_id.clone().unwrap_or(session.0.id.clone());
    state.sandbox().write_file(&user_id, &body.workspace_id, &body.path, body.content.as_bytes()).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `POST /api/sandbox/files/upload` — raw body, `X-Workspace-Id` and
/// `X-Filename` headers (spec.md §4.10, §6).
pub async fn sandbox_files_upload(State(state): State<AppState>, session: TypedSession, headers: HeaderMap, body: Bytes) -> Result<impl IntoResponse> {
    let user_id = session.0.user_id.clone().unwrap_or(session.0.id.clone());
    let workspace_id = headers
        .get("x-workspace-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::BadRequest("missing X-Workspace-Id header".into()))?;
    let filename = headers
        .get("x-filename")
        .and_then(|v| v.to_str().ok())
        .map(sanitize_filename)
        .unwrap_or_else(|| "upload.bin".to_string());
    state.sandbox().write_file(&user_id, workspace_id, &filename, &body).await?;
    Ok(Json(serde_json::json!({ "ok": true, "filename": filename })))
}

/// `GET /api/sandbox/artifacts/{runId}/{path*}` (spec.md §4.10, §6, §8
/// invariant 7: no resolution outside `runs/{runId}/artifacts/`). Serves with
/// a strict MIME allowlist and response headers that prevent the browser
/// from ever treating an artifact as same-origin executable content.
pub async fn sandbox_artifact(
    State(state): State<AppState>,
    session: TypedSession,
    AxumPath((run_id, artifact_path)): AxumPath<(String, String)>,
) -> Result<impl IntoResponse> {
    let user_id = session.0.user_id.clone().unwrap_or(session.0.id.clone());
    let run = state.sandbox().get_run(&run_id).ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
    let path = state.sandbox().artifact_path(&user_id, &run.workspace_id, &run_id, &artifact_path)?;

    let extension = std::path::Path::new(&artifact_path).extension().and_then(|e| e.to_str()).unwrap_or("");
    let mime = allowed_artifact_mime(extension).ok_or_else(|| Error::PolicyBlocked(format!("artifact extension {extension} is not servable")))?;

    let bytes = tokio::fs::read(&path).await.map_err(|_| Error::NotFound(format!("artifact {artifact_path}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::CONTENT_TYPE, mime.parse().unwrap());
    headers.insert("x-content-type-options", "nosniff".parse().unwrap());
    headers.insert("x-frame-options", "DENY".parse().unwrap());
    headers.insert("content-security-policy", "default-src 'none'".parse().unwrap());
    headers.insert(axum::http::header::CACHE_CONTROL, "no-store".parse().unwrap());
    Ok((headers, bytes))
}

#[derive(Debug, Deserialize)]
pub struct ToolCallEnvelope {
    pub kuro_tool_call: ToolCall,
}

#[derive(Debug, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ToolResultEnvelope {
    pub kuro_tool_result: ToolResult,
}

#[derive(Debug, Serialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub truncated: bool,
}

/// `POST /api/tools/invoke` — JSON-tool protocol (spec.md §6, scenario S6).
/// No tools are registered yet; every call reports `ok:false` with the
/// unknown-tool error rather than a transport failure.
pub async fn tools_invoke(Json(body): Json<ToolCallEnvelope>) -> impl IntoResponse {
    let call = body.kuro_tool_call;
    Json(ToolResultEnvelope {
        kuro_tool_result: ToolResult {
            id: call.id,
            name: call.name.clone(),
            ok: false,
            result: None,
            error: Some(format!("unknown tool: {}", call.name)),
            truncated: false,
        },
    })
}

#[derive(Debug, Serialize)]
pub struct AuditStatsResponse {
    pub total_recent: usize,
    pub ok: usize,
    pub denied: usize,
    pub error: usize,
}

/// `GET /api/audit/stats` (spec.md §6) — tallies outcomes over the most
/// recent window rather than scanning the full chain on every call.
pub async fn audit_stats(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let entries = state.audit().recent(1000).await?;
    let mut ok = 0;
    let mut denied = 0;
    let mut error = 0;
    for entry in &entries {
        match entry.result {
            AuditResult::Ok => ok += 1,
            AuditResult::Denied => denied += 1,
            AuditResult::Error => error += 1,
        }
    }
    Ok(Json(AuditStatsResponse { total_recent: entries.len(), ok, denied, error }))
}

/// `GET /api/sovereignty/status` (spec.md §6, C14) — aggregates audit-derived
/// locality proof (local vs. escalated-to-provider turns) alongside the
/// ambient health snapshot. GPU/thermal telemetry has no sensor to read from
/// in this deployment shape, so it reports as a disabled feature rather than
/// a fabricated reading (spec.md §9 "explicit feature flags").
pub async fn sovereignty_status(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let entries = state.audit().recent(1000).await?;
    let escalated = entries.iter().filter(|e| e.action == "escalate").count();
    let local = entries.iter().filter(|e| e.action == "stream_complete" || e.action == "stream_error").count().saturating_sub(escalated);

    Ok(Json(serde_json::json!({
        "locality": { "local": local, "escalated": escalated, "frontier_enabled": state.frontier().config().enabled },
        "health": state.health().aggregate(),
        "thermal_advisory": { "available": false, "reason": "no thermal sensor in this deployment" },
    })))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/stream", post(stream_chat))
        .route("/api/embed", post(embed))
        .route("/api/ingest", post(ingest))
        .route("/api/rag/query", post(rag_query))
        .route("/api/rag/stats", get(rag_stats))
        .route("/api/rag/clear", post(rag_clear))
        .route("/api/files/upload", post(files_upload))
        .route("/api/capability/profiles", get(capability_profiles))
        .route("/api/capability/negotiate", post(capability_negotiate))
        .route("/api/frontier/status", get(frontier_status))
        .route("/api/quota/status", get(quota_status))
        .route("/api/audit/recent", get(audit_recent))
        .route("/api/audit/seal", post(audit_seal))
        .route("/api/audit/verify", get(audit_verify))
        .route("/api/audit/verify/all", get(audit_verify_all))
        .route("/api/audit/stats", get(audit_stats))
        .route("/api/sandbox/workspaces", post(sandbox_create_workspace))
        .route("/api/sandbox/files/write", post(sandbox_files_write))
        .route("/api/sandbox/files/upload", post(sandbox_files_upload))
        .route("/api/sandbox/run", post(sandbox_run))
        .route("/api/sandbox/run/:run_id", get(sandbox_run_status))
        .route("/api/sandbox/artifacts/:run_id/*path", get(sandbox_artifact))
        .route("/api/tools/invoke", post(tools_invoke))
        .route("/api/sovereignty/status", get(sovereignty_status))
        .route("/api/health", get(health))
        .with_state(state)
}
