//! Optional generate-judge-merge multi-candidate synthesis (spec.md §4.8).

use async_trait::async_trait;

use crate::capability::tier_rank;
use crate::config::SynthesisConfig;
use crate::error::{Error, Result};

/// Seam over the three backend calls synthesis needs (candidate generation,
/// judging, merging) — same trait-over-backend pattern as
/// [`crate::retrieval::EmbeddingClient`].
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
    /// Returns a score per candidate, same length and order as `candidates`.
    async fn judge(&self, prompt: &str, candidates: &[String]) -> Result<Vec<f32>>;
    async fn merge(&self, prompt: &str, a: &str, b: &str) -> Result<String>;
}

/// Production backend calling the same local LLM HTTP endpoint three ways
/// (generate/judge/merge), same client-reuse pattern as
/// [`crate::retrieval::HttpEmbeddingClient`].
pub struct HttpSynthesisBackend {
    client: reqwest::Client,
    chat_url: String,
}

impl HttpSynthesisBackend {
    pub fn new(client: reqwest::Client, chat_url: String) -> Self {
        Self { client, chat_url }
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            prompt: &'a str,
            stream: bool,
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            text: String,
        }

        let resp = self
            .client
            .post(&self.chat_url)
            .json(&Req { prompt, stream: false })
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("synthesis backend unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::Upstream(format!("synthesis backend returned {}", resp.status())));
        }

        resp.json::<Resp>().await.map(|r| r.text).map_err(|e| Error::Upstream(format!("malformed synthesis response: {e}")))
    }
}

#[async_trait]
impl SynthesisBackend for HttpSynthesisBackend {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.complete(prompt).await
    }

    async fn judge(&self, prompt: &str, candidates: &[String]) -> Result<Vec<f32>> {
        let joined = candidates.iter().enumerate().map(|(i, c)| format!("[{i}] {c}")).collect::<Vec<_>>().join("\n\n");
        let judged = self.complete(&format!("{prompt}\n\nScore each candidate 0.0-1.0:\n{joined}")).await?;
        let scores: Vec<f32> = judged.split_whitespace().filter_map(|token| token.parse().ok()).collect();
        if scores.len() == candidates.len() {
            Ok(scores)
        } else {
            Ok(vec![0.5; candidates.len()])
        }
    }

    async fn merge(&self, prompt: &str, a: &str, b: &str) -> Result<String> {
        self.complete(&format!("{prompt}\n\nMerge these two answers into one:\n\nA: {a}\n\nB: {b}")).await
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SynthesisOutcome {
    pub text: String,
    pub candidate_count: usize,
    pub strategy: String,
}

pub fn should_synthesize(config: &SynthesisConfig, tier: &str, requested: bool) -> bool {
    config.enabled && requested && tier_rank(tier) >= tier_rank(&config.min_tier)
}

/// Generates `config.candidates` completions in parallel, judges them, and
/// merges the top two. Falls back to the caller on any internal failure —
/// per spec.md §4.8 "On any internal failure the orchestrator falls back to
/// single-candidate streaming" — by returning `Ok(None)` rather than erroring.
pub async fn synthesize(
    backend: &dyn SynthesisBackend,
    config: &SynthesisConfig,
    prompt: &str,
) -> Option<SynthesisOutcome> {
    let n = config.candidates.max(2) as usize;
    let mut candidates = Vec::with_capacity(n);
    for _ in 0..n {
        match backend.generate(prompt).await {
            Ok(c) => candidates.push(c),
            Err(_) => return None,
        }
    }

    let scores = match backend.judge(prompt, &candidates).await {
        Ok(s) if s.len() == candidates.len() => s,
        _ => return None,
    };

    let mut ranked: Vec<(usize, f32)> = scores.into_iter().enumerate().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let Some(&(top_idx, _)) = ranked.first() else { return None };
    let Some(&(second_idx, _)) = ranked.get(1) else {
        return Some(SynthesisOutcome {
            text: candidates[top_idx].clone(),
            candidate_count: candidates.len(),
            strategy: "single_candidate_fallback".into(),
        });
    };

    match backend.merge(prompt, &candidates[top_idx], &candidates[second_idx]).await {
        Ok(merged) => Some(SynthesisOutcome { text: merged, candidate_count: candidates.len(), strategy: "generate_judge_merge".into() }),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBackend {
        fail_at: Option<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SynthesisBackend for FakeBackend {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            if self.fail_at == Some("generate") {
                return Err(crate::error::Error::Upstream("down".into()));
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("candidate-{n}"))
        }

        async fn judge(&self, _prompt: &str, candidates: &[String]) -> Result<Vec<f32>> {
            if self.fail_at == Some("judge") {
                return Err(crate::error::Error::Upstream("down".into()));
            }
            Ok((0..candidates.len()).map(|i| i as f32).collect())
        }

        async fn merge(&self, _prompt: &str, a: &str, b: &str) -> Result<String> {
            Ok(format!("merged({a},{b})"))
        }
    }

    fn config() -> SynthesisConfig {
        SynthesisConfig { enabled: true, candidates: 2, min_tier: "pro".into() }
    }

    #[test]
    fn free_tier_never_synthesizes() {
        assert!(!should_synthesize(&config(), "free", true));
    }

    #[test]
    fn pro_tier_synthesizes_when_requested() {
        assert!(should_synthesize(&config(), "pro", true));
    }

    #[tokio::test]
    async fn synthesize_merges_top_two_candidates() {
        let backend = FakeBackend { fail_at: None, calls: AtomicUsize::new(0) };
        let outcome = synthesize(&backend, &config(), "prompt").await.unwrap();
        assert_eq!(outcome.strategy, "generate_judge_merge");
    }

    #[tokio::test]
    async fn generation_failure_falls_back_to_none() {
        let backend = FakeBackend { fail_at: Some("generate"), calls: AtomicUsize::new(0) };
        assert!(synthesize(&backend, &config(), "prompt").await.is_none());
    }
}
