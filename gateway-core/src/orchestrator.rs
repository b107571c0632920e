//! Streaming orchestrator: the end-to-end chat request lifecycle from
//! validated body to SSE termination (spec.md §4.7, "the hardest part").

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;

use crate::audit::{AuditEntry, AuditLogger, AuditResult};
use crate::capability::{tier_rank, CapabilitySummary, EffectivePolicy};
use crate::config::SynthesisConfig;
use crate::frontier::{FrontierRouter, RouteDecision};
use crate::pipeline::{self, ChatMessage, ThreatFilter, ThreatVerdict};
use crate::quota::{QuotaAction, QuotaService};
use crate::retrieval::{EmbeddingClient, RetrievalLayer};
use crate::synthesis::{self, should_synthesize, SynthesisBackend};
use crate::vector_store::{Namespace, VectorStore};

const KEEPALIVE_SECS: u64 = 15;

/// Per-session handle enabling mid-stream correction/abort (spec.md §4.7
/// step 4, step 8; cancellation via client disconnect).
#[derive(Default)]
pub struct StreamHandle {
    pub abort: AtomicBool,
    pub correction_pending: AtomicBool,
    pub partial: std::sync::Mutex<String>,
}

/// Tracks in-flight stream handles keyed by session id so a separate
/// "request correction" call (or a disconnect handler) can reach them.
#[derive(Default)]
pub struct StreamRegistry {
    handles: DashMap<String, Arc<StreamHandle>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str) -> Arc<StreamHandle> {
        let handle = Arc::new(StreamHandle::default());
        self.handles.insert(session_id.to_string(), handle.clone());
        handle
    }

    pub fn deregister(&self, session_id: &str) {
        self.handles.remove(session_id);
    }

    /// Flags an in-flight stream to abort for a pending correction
    /// (spec.md §4.7 step 8). Returns false if no such stream is registered.
    pub fn request_correction(&self, session_id: &str) -> bool {
        match self.handles.get(session_id) {
            Some(handle) => {
                handle.correction_pending.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

pub struct ChatRequest {
    pub session_id: String,
    pub user_id: String,
    pub tier: String,
    pub is_guest: bool,
    pub guest_fingerprint: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// The client's raw power-dial request, before tier/device/infra
    /// resolution — kept for audit observability on downgrade.
    pub requested_profile: String,
    pub policy: EffectivePolicy,
    pub capability_summary: CapabilitySummary,
}

/// Backend chat-completion stream seam (spec.md §4.7 step 7). Production
/// implementations POST to the configured backend with `stream=true`; tests
/// supply an in-memory fake.
#[async_trait::async_trait]
pub trait BackendStream: Send + Sync {
    async fn stream_tokens(&self, prompt: &str) -> crate::error::Result<Vec<String>>;
}

/// Production backend: POSTs to the local LLM chat endpoint and splits the
/// newline-delimited JSON-frame response into a token list (spec.md §4.7
/// step 7, simplified to a whole-buffer read rather than a true chunked
/// reader — `gateway-core` does not perform true chunk-by-chunk streaming
/// against an external test double).
pub struct HttpChatBackend {
    client: reqwest::Client,
    chat_url: String,
}

impl HttpChatBackend {
    pub fn new(client: reqwest::Client, chat_url: String) -> Self {
        Self { client, chat_url }
    }
}

#[async_trait::async_trait]
impl BackendStream for HttpChatBackend {
    async fn stream_tokens(&self, prompt: &str) -> crate::error::Result<Vec<String>> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            prompt: &'a str,
            stream: bool,
        }
        #[derive(serde::Deserialize)]
        struct Frame {
            token: String,
        }

        let resp = self
            .client
            .post(&self.chat_url)
            .json(&Req { prompt, stream: true })
            .send()
            .await
            .map_err(|e| crate::error::Error::Upstream(format!("backend unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(crate::error::Error::Upstream(format!("backend returned {}", resp.status())));
        }

        let body = resp.text().await.map_err(|e| crate::error::Error::Upstream(format!("malformed backend response: {e}")))?;
        let tokens = body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<Frame>(line).ok())
            .map(|frame| frame.token)
            .collect();
        Ok(tokens)
    }
}

/// Everything the orchestrator needs, Arc-held so the driving async task
/// can be `'static` regardless of caller lifetimes.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub audit: Arc<AuditLogger>,
    pub quota: Arc<QuotaService>,
    pub vectors: Arc<VectorStore>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub frontier: Arc<FrontierRouter>,
    pub synthesis_backend: Option<Arc<dyn SynthesisBackend>>,
    pub synthesis_config: SynthesisConfig,
    pub registry: Arc<StreamRegistry>,
    pub threat_filter: Arc<ThreatFilter>,
    pub backend: Arc<dyn BackendStream>,
}

/// Runs the full pipeline for one chat request and returns an SSE response.
/// Step numbers in comments follow spec.md §4.7.
pub fn run_stream(request: ChatRequest, deps: OrchestratorDeps) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<Event>();

    // Step 2: guest gate.
    if request.is_guest {
        if let Some(fp) = &request.guest_fingerprint {
            if deps.quota.check_guest(fp).is_err() {
                let _ = tx.send(Event::default().event("gate").data(r#"{"reason":"guest_quota_exceeded"}"#));
                return sse_from_receiver(rx);
            }
        }
    }

    // Step 4: register stream handle.
    let handle = deps.registry.register(&request.session_id);

    tokio::spawn(drive_stream(request, deps, handle, tx));

    sse_from_receiver(rx)
}

/// Extracts bracketed `<think>...</think>` reasoning blocks from backend
/// output (spec.md §4.7 step 7, invariant 8): thinking text is stripped from
/// the visible reply and surfaced as its own coalesced-per-sentence event.
/// Text with no `<think>` tag passes through unchanged, so re-feeding an
/// already-stripped reply is a no-op.
struct ThinkingExtractor {
    in_thinking: bool,
    thinking_buf: String,
}

impl ThinkingExtractor {
    fn new() -> Self {
        Self { in_thinking: false, thinking_buf: String::new() }
    }

    /// Feed one chunk of raw backend output. Returns the visible text (tags
    /// stripped) and any thinking sentences completed by this chunk.
    fn feed(&mut self, chunk: &str) -> (String, Vec<String>) {
        let mut visible = String::new();
        let mut sentences = Vec::new();
        let mut rest = chunk;

        loop {
            if self.in_thinking {
                match rest.find("</think>") {
                    Some(idx) => {
                        self.thinking_buf.push_str(&rest[..idx]);
                        self.in_thinking = false;
                        rest = &rest[idx + "</think>".len()..];
                        Self::drain_sentences(&mut self.thinking_buf, &mut sentences, true);
                    }
                    None => {
                        self.thinking_buf.push_str(rest);
                        Self::drain_sentences(&mut self.thinking_buf, &mut sentences, false);
                        break;
                    }
                }
            } else {
                match rest.find("<think>") {
                    Some(idx) => {
                        visible.push_str(&rest[..idx]);
                        self.in_thinking = true;
                        rest = &rest[idx + "<think>".len()..];
                    }
                    None => {
                        visible.push_str(rest);
                        break;
                    }
                }
            }
        }

        (visible, sentences)
    }

    /// Splits `buf` on sentence terminators, pushing complete sentences into
    /// `out`. When `flush` is true (the closing tag was just reached), any
    /// trailing fragment is emitted too rather than held for more input.
    fn drain_sentences(buf: &mut String, out: &mut Vec<String>, flush: bool) {
        loop {
            let Some(idx) = buf.find(['.', '!', '?']) else { break };
            let sentence = buf[..=idx].trim().to_string();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            *buf = buf[idx + 1..].to_string();
        }
        if flush {
            let remainder = buf.trim().to_string();
            if !remainder.is_empty() {
                out.push(remainder);
            }
            buf.clear();
        }
    }
}

async fn drive_stream(request: ChatRequest, deps: OrchestratorDeps, handle: Arc<StreamHandle>, tx: mpsc::UnboundedSender<Event>) {
    let ChatRequest { session_id, user_id, tier, is_guest, guest_fingerprint, messages, requested_profile, policy, capability_summary } = request;

    let _ = tx.send(Event::default().event("capability").data(serde_json::to_string(&capability_summary).unwrap_or_default()));
    if capability_summary.downgraded {
        let _ = deps
            .audit
            .log(
                AuditEntry::new("capability", "downgraded", AuditResult::Ok)
                    .with_user_id(&user_id)
                    .with_target(&session_id)
                    .with_meta(serde_json::json!({
                        "requested_profile": requested_profile,
                        "resolved_profile": capability_summary.profile,
                        "reason": capability_summary.downgrade_reason,
                    })),
            )
            .await;
    }

    let messages = crate::retrieval::compact_history(messages, policy.history_turns);

    // Step 5: pipeline stages, each with a `layer` event at entry/exit.
    emit_layer(&tx, "threat_filter", "active");
    if deps.threat_filter.check(&messages) == ThreatVerdict::Blocked {
        emit_layer(&tx, "threat_filter", "blocked");
        finish(&tx, &deps, &session_id, &user_id, r#"{"blocked":"threat_filter"}"#, false).await;
        deps.registry.deregister(&session_id);
        return;
    }
    emit_layer(&tx, "threat_filter", "complete");

    let last_message = messages.last().map(|m| m.content.as_str()).unwrap_or("");
    let intent = pipeline::route_intent(last_message, &[]);
    emit_layer(&tx, "intent_router", if intent.blocked { "blocked" } else { "complete" });
    if intent.blocked {
        finish(&tx, &deps, &session_id, &user_id, r#"{"blocked":"intent_router"}"#, false).await;
        deps.registry.deregister(&session_id);
        return;
    }

    let quota_action = QuotaAction::Chat;
    let quota_status = deps.quota.check_quota(&user_id, &tier, quota_action);
    if !quota_status.allowed {
        let _ = tx.send(Event::default().event("gate").data(serde_json::to_string(&quota_status).unwrap_or_default()));
        finish(&tx, &deps, &session_id, &user_id, r#"{"blocked":"quota"}"#, false).await;
        deps.registry.deregister(&session_id);
        return;
    }

    emit_layer(&tx, "retrieval", "active");
    let retrieval = RetrievalLayer::with_audit(&deps.vectors, deps.embedder.as_ref(), &deps.audit);
    let retrieved = retrieval
        .retrieve(&user_id, Namespace::Edubba, last_message, policy.retrieval_top_k, 0.0)
        .await
        .unwrap_or_default();
    emit_layer(&tx, "retrieval", "complete");

    let caller_level = tier_rank(&tier);
    let selection = pipeline::select_agent(&intent, &policy, caller_level);
    emit_layer(&tx, "agent_orchestrator", if selection.downgraded { "downgraded" } else { "complete" });

    let mode_prompt = if policy.reasoning { "Think step by step before answering." } else { "Answer directly and concisely." };
    let agent_header = format!("[agent:{}]", selection.agent);
    emit_layer(&tx, "prompt_builder", "complete");

    // Step: frontier local-vs-escalate decision (spec.md §4.9). `poh` is
    // derived from the intent router's reasoning level until a dedicated
    // fire-control stage exists: a higher reasoning level implies lower
    // confidence that the local backend alone will answer well.
    let poh = 1.0 - (intent.reasoning_level as f64 / 3.0).min(1.0);
    let decision = frontier_decide(&deps.frontier, &user_id, &tier, poh);
    let _ = tx.send(Event::default().event("routing").data(format!(
        r#"{{"decision":"{}","poh":{poh:.3}}}"#,
        if decision == RouteDecision::Escalate { "escalate" } else { "local" }
    )));
    if decision == RouteDecision::Escalate {
        let _ = deps
            .audit
            .log(
                AuditEntry::new("frontier", "escalate", AuditResult::Ok)
                    .with_user_id(&user_id)
                    .with_target(&session_id)
                    .with_meta(serde_json::json!({
                        "provider": deps.frontier.config().provider_url,
                        "model": "external",
                        "poh": poh,
                    })),
            )
            .await;
    }

    let prompt = pipeline::build_prompt(mode_prompt, None, &[], &retrieved, &agent_header);

    // Step 6: optional synthesis ahead of single-candidate streaming, gated
    // by tier and the resolved policy's reasoning toggle (spec.md §4.8).
    let reply = if should_synthesize(&deps.synthesis_config, &tier, policy.reasoning) {
        match deps.synthesis_backend.as_deref() {
            Some(backend) => synthesis::synthesize(backend, &deps.synthesis_config, &prompt).await.map(|o| o.text),
            None => None,
        }
    } else {
        None
    };

    // Step 7/8: backend streaming, token by token, honoring mid-stream
    // correction requests.
    let tokens = match reply {
        Some(text) => vec![text],
        None => match deps.backend.stream_tokens(&prompt).await {
            Ok(t) => t,
            Err(e) => {
                let _ = tx.send(Event::default().event("error").data(format!(r#"{{"message":"{e}"}}"#)));
                finish(&tx, &deps, &session_id, &user_id, "", true).await;
                deps.registry.deregister(&session_id);
                return;
            }
        },
    };

    let mut emitted = 0usize;
    let mut extractor = ThinkingExtractor::new();
    let mut assistant_reply = String::new();
    for token in &tokens {
        if handle.correction_pending.load(Ordering::SeqCst) {
            let _ = tx.send(Event::default().event("aborted_for_correction").data("{}"));
            deps.registry.deregister(&session_id);
            return;
        }
        let (visible, thinking_sentences) = extractor.feed(token);
        for sentence in thinking_sentences {
            let _ = tx.send(Event::default().event("thinking").data(serde_json::json!({ "text": sentence }).to_string()));
        }
        if !visible.is_empty() {
            let _ = tx.send(Event::default().event("token").data(visible.clone()));
            handle.partial.lock().unwrap().push_str(&visible);
            assistant_reply.push_str(&visible);
        }
        emitted += 1;
    }

    // Step 9: done event, quota consumption, history + response-trace record.
    if is_guest {
        if let Some(fp) = &guest_fingerprint {
            deps.quota.consume_guest(fp);
            let used = deps.quota.guest_used(fp);
            let _ = tx.send(Event::default().event("guest_quota").data(serde_json::json!({ "used": used }).to_string()));
        }
    }
    let _ = tx.send(Event::default().event("done").data(format!(r#"{{"tokens":{emitted},"session_id":"{session_id}"}}"#)));
    deps.quota.record_usage(&user_id, quota_action);

    let retrieval = RetrievalLayer::with_audit(&deps.vectors, deps.embedder.as_ref(), &deps.audit);
    let _ = retrieval.record_turn(&user_id, &session_id, &assistant_reply).await;

    finish(&tx, &deps, &session_id, &user_id, "", false).await;
    deps.registry.deregister(&session_id);
}

async fn finish(_tx: &mpsc::UnboundedSender<Event>, deps: &OrchestratorDeps, session_id: &str, user_id: &str, _unused: &str, was_error: bool) {
    let action = if was_error { "stream_error" } else { "stream_complete" };
    let result = if was_error { AuditResult::Error } else { AuditResult::Ok };
    let _ = deps
        .audit
        .log(AuditEntry::new("orchestrator", action, result).with_user_id(user_id).with_target(session_id))
        .await;
}

fn emit_layer(tx: &mpsc::UnboundedSender<Event>, stage: &str, status: &str) {
    let _ = tx.send(Event::default().event("layer").data(format!(r#"{{"stage":"{stage}","status":"{status}"}}"#)));
}

fn sse_from_receiver(rx: mpsc::UnboundedReceiver<Event>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (Ok(event), rx)) });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(KEEPALIVE_SECS)).text(":ka"))
}

/// Decides local-vs-escalate for a request given a heuristic confidence
/// score, recording the escalation on success (spec.md §4.9).
pub fn frontier_decide(frontier: &FrontierRouter, user_id: &str, tier: &str, poh: f64) -> RouteDecision {
    let decision = frontier.decide(user_id, tier, poh);
    if decision == RouteDecision::Escalate {
        frontier.record_escalation(user_id);
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::FileAuditStorage;
    use crate::config::{AuditConfig, FrontierConfig, GuestConfig, TiersConfig};

    struct FakeBackend;
    #[async_trait::async_trait]
    impl BackendStream for FakeBackend {
        async fn stream_tokens(&self, _prompt: &str) -> crate::error::Result<Vec<String>> {
            Ok(vec!["hello".into(), " world".into()])
        }
    }

    struct NullEmbedder;
    #[async_trait::async_trait]
    impl EmbeddingClient for NullEmbedder {
        async fn embed(&self, _text: &str) -> crate::error::Result<Vec<f32>> {
            Ok(Vec::new())
        }
    }

    async fn deps(dir: &std::path::Path) -> OrchestratorDeps {
        let storage = Arc::new(FileAuditStorage::new(dir.join("audit")));
        let audit = Arc::new(AuditLogger::load(storage, AuditConfig::default(), None).await.unwrap());
        let quota = Arc::new(QuotaService::new(dir.join("quota"), TiersConfig::default(), GuestConfig::default()));
        let vectors = Arc::new(VectorStore::new(dir.join("vectors")));
        OrchestratorDeps {
            audit,
            quota,
            vectors,
            embedder: Arc::new(NullEmbedder),
            frontier: Arc::new(FrontierRouter::new(FrontierConfig::default())),
            synthesis_backend: None,
            synthesis_config: SynthesisConfig::default(),
            registry: Arc::new(StreamRegistry::new()),
            threat_filter: Arc::new(ThreatFilter::default()),
            backend: Arc::new(FakeBackend),
        }
    }

    #[tokio::test]
    async fn registry_round_trips_registration() {
        let registry = StreamRegistry::new();
        let handle = registry.register("s1");
        assert!(!handle.correction_pending.load(Ordering::SeqCst));
        assert!(registry.request_correction("s1"));
        assert!(handle.correction_pending.load(Ordering::SeqCst));
        registry.deregister("s1");
        assert!(!registry.request_correction("s1"));
    }

    fn default_policy() -> EffectivePolicy {
        EffectivePolicy {
            profile: "instant".into(),
            context_tokens: 2_048,
            temperature: 0.3,
            reasoning: false,
            speculative: false,
            retrieval_top_k: 3,
            history_turns: 4,
        }
    }

    fn default_summary() -> CapabilitySummary {
        CapabilitySummary { profile: "instant".into(), downgraded: false, downgrade_reason: None }
    }

    #[tokio::test]
    async fn run_stream_emits_tokens_and_done() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(dir.path()).await;
        let request = ChatRequest {
            session_id: "sess-1".into(),
            user_id: "u1".into(),
            tier: "free".into(),
            is_guest: false,
            guest_fingerprint: None,
            messages: vec![ChatMessage { role: "user".into(), content: "hi there".into() }],
            requested_profile: "instant".into(),
            policy: default_policy(),
            capability_summary: default_summary(),
        };
        let _sse = run_stream(request, deps);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn guest_request_emits_guest_quota_before_done() {
        let dir = tempfile::tempdir().unwrap();
        let deps = deps(dir.path()).await;
        let request = ChatRequest {
            session_id: "sess-2".into(),
            user_id: "guest".into(),
            tier: "free".into(),
            is_guest: true,
            guest_fingerprint: Some("fp-1".into()),
            messages: vec![ChatMessage { role: "user".into(), content: "hi there".into() }],
            requested_profile: "instant".into(),
            policy: default_policy(),
            capability_summary: default_summary(),
        };
        let _sse = run_stream(request, deps.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(deps.quota.guest_used("fp-1"), 1);
    }

    #[test]
    fn frontier_decide_records_escalation_only_on_escalate() {
        let config = FrontierConfig { enabled: true, poh_threshold: 0.9, hourly_quota: 5, ..FrontierConfig::default() };
        let frontier = FrontierRouter::new(config);
        let decision = frontier_decide(&frontier, "u1", "free", 0.1);
        assert_eq!(decision, RouteDecision::Escalate);
        assert_eq!(frontier_decide(&frontier, "u1", "free", 0.1), RouteDecision::Escalate);
    }

    #[test]
    fn thinking_extractor_strips_and_coalesces_sentences() {
        let mut extractor = ThinkingExtractor::new();
        let (visible, sentences) = extractor.feed("hello <think>reasoning one. reasoning two.</think> world");
        assert_eq!(visible, "hello  world");
        assert_eq!(sentences, vec!["reasoning one.".to_string(), "reasoning two.".to_string()]);
    }

    #[test]
    fn thinking_extractor_is_idempotent_on_already_visible_text() {
        let mut first = ThinkingExtractor::new();
        let (visible, _) = first.feed("plain reply with no reasoning block");

        let mut second = ThinkingExtractor::new();
        let (visible_again, sentences_again) = second.feed(&visible);

        assert_eq!(visible, visible_again);
        assert!(sentences_again.is_empty());
    }

    #[test]
    fn thinking_extractor_holds_open_block_across_chunks() {
        let mut extractor = ThinkingExtractor::new();
        let (visible1, sentences1) = extractor.feed("before <think>partial reasoning");
        assert_eq!(visible1, "before ");
        assert!(sentences1.is_empty());

        let (visible2, sentences2) = extractor.feed(" continues.</think> after");
        assert_eq!(visible2, " after");
        assert_eq!(sentences2, vec!["partial reasoning continues.".to_string()]);
    }
}
