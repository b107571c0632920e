//! Fixed ordered pipeline stages every chat request traverses before
//! reaching the backend (spec.md §4.6).

use serde::Serialize;

use crate::capability::EffectivePolicy;
use crate::vector_store::QueryResult;

/// A chat message as carried in the request body (spec.md §6 `/api/stream`).
#[derive(Debug, Clone, serde::Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreatVerdict {
    Clear,
    Blocked,
}

/// Deny-pattern threat filter over the message list. Grounded on the
/// connector gate's denylist-regex approach (spec.md §4.4), generalized to
/// chat content instead of shell commands.
pub struct ThreatFilter {
    denylist: Vec<regex::Regex>,
}

impl ThreatFilter {
    pub fn new(patterns: &[String]) -> Self {
        let denylist = patterns.iter().filter_map(|p| regex::Regex::new(p).ok()).collect();
        Self { denylist }
    }

    pub fn check(&self, messages: &[ChatMessage]) -> ThreatVerdict {
        let Some(last) = messages.last() else { return ThreatVerdict::Clear };
        if self.denylist.iter().any(|re| re.is_match(&last.content)) {
            return ThreatVerdict::Blocked;
        }
        ThreatVerdict::Clear
    }
}

impl Default for ThreatFilter {
    fn default() -> Self {
        Self::new(&[])
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentResult {
    pub intent: String,
    pub suggested_temperature: f32,
    pub reasoning_level: u8,
    pub blocked: bool,
}

/// Deployment-configurable intent categories that are blocked outright
/// (spec.md §4.6: "deployment policy may block categories").
pub fn route_intent(last_message: &str, blocked_intents: &[String]) -> IntentResult {
    let intent = classify_intent(last_message);
    let blocked = blocked_intents.iter().any(|b| b == &intent);
    IntentResult {
        intent,
        suggested_temperature: 0.6,
        reasoning_level: if blocked { 0 } else { 1 },
        blocked,
    }
}

fn classify_intent(message: &str) -> String {
    let lower = message.to_lowercase();
    if lower.contains("code") || lower.contains("debug") || lower.contains("fn ") {
        "code".to_string()
    } else if lower.contains("?") {
        "question".to_string()
    } else {
        "chat".to_string()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSelection {
    pub agent: String,
    pub mode: String,
    pub downgraded: bool,
    pub downgrade_reason: Option<String>,
}

/// Selects an agent/mode for the intent, bounded by the caller's resolved
/// capability policy (spec.md §4.6 "Agent orchestrator").
pub fn select_agent(intent: &IntentResult, policy: &EffectivePolicy, caller_level: u8) -> AgentSelection {
    let mut mode = if policy.reasoning { "reasoning" } else { "direct" }.to_string();
    let mut downgraded = false;
    let mut reason = None;

    if caller_level == 0 && mode == "reasoning" {
        mode = "direct".to_string();
        downgraded = true;
        reason = Some("caller level too low for reasoning mode".to_string());
    }

    let agent = match intent.intent.as_str() {
        "code" => "coder",
        "question" => "researcher",
        _ => "generalist",
    }
    .to_string();

    AgentSelection { agent, mode, downgraded, downgrade_reason: reason }
}

/// Final assembled system prompt (spec.md §4.6 "Prompt builder").
pub fn build_prompt(
    mode_prompt: &str,
    skill_addendum: Option<&str>,
    ghost_protocol_flags: &[String],
    retrieved: &[QueryResult],
    agent_header: &str,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(agent_header);
    prompt.push('\n');
    prompt.push_str(mode_prompt);

    if let Some(skill) = skill_addendum {
        prompt.push_str("\n\n");
        prompt.push_str(skill);
    }

    for flag in ghost_protocol_flags {
        prompt.push_str("\n[ghost:");
        prompt.push_str(flag);
        prompt.push(']');
    }

    if !retrieved.is_empty() {
        prompt.push_str("\n\nContext:\n");
        for r in retrieved {
            prompt.push_str("- ");
            prompt.push_str(&r.document);
            prompt.push('\n');
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(content: &str) -> ChatMessage {
        ChatMessage { role: "user".into(), content: content.into() }
    }

    #[test]
    fn threat_filter_blocks_matching_pattern() {
        let filter = ThreatFilter::new(&["(?i)rm -rf /".to_string()]);
        assert_eq!(filter.check(&[msg("please run rm -rf /")]), ThreatVerdict::Blocked);
    }

    #[test]
    fn threat_filter_clears_clean_message() {
        let filter = ThreatFilter::new(&["(?i)rm -rf /".to_string()]);
        assert_eq!(filter.check(&[msg("hello there")]), ThreatVerdict::Clear);
    }

    #[test]
    fn blocked_intent_is_flagged() {
        let result = route_intent("can you debug this?", &["code".to_string()]);
        assert!(result.blocked);
    }

    #[test]
    fn low_caller_level_downgrades_reasoning_mode() {
        let intent = route_intent("why is the sky blue?", &[]);
        let policy = EffectivePolicy {
            profile: "balanced".into(),
            context_tokens: 8_192,
            temperature: 0.6,
            reasoning: true,
            speculative: false,
            retrieval_top_k: 6,
            history_turns: 12,
        };
        let selection = select_agent(&intent, &policy, 0);
        assert!(selection.downgraded);
        assert_eq!(selection.mode, "direct");
    }

    #[test]
    fn prompt_includes_retrieved_context() {
        let retrieved = vec![QueryResult {
            document: "fact one".into(),
            metadata: Default::default(),
            score: 0.9,
        }];
        let prompt = build_prompt("base", None, &[], &retrieved, "agent:generalist");
        assert!(prompt.contains("fact one"));
    }
}
