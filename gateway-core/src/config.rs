//! Configuration management using Figment.
//!
//! Precedence (highest to lowest):
//! 1. Environment variables (prefix: `GATEWAY_`)
//! 2. Current working directory: `./config.toml`
//! 3. XDG config directory: `~/.config/gateway/{service_name}/config.toml`
//! 4. System directory: `/etc/gateway/{service_name}/config.toml`
//! 5. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub data: DataConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub tiers: TiersConfig,
    #[serde(default)]
    pub guest: GuestConfig,
    #[serde(default)]
    pub capability: CapabilityConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub sse: SseConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub frontier: FrontierConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub middleware: MiddlewareConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Filesystem data root layout (spec.md §6 persisted state layout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_root")]
    pub root: PathBuf,
}

impl DataConfig {
    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }
    pub fn vectors_dir(&self) -> PathBuf {
        self.root.join("vectors")
    }
    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }
    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }
    pub fn sandboxes_dir(&self) -> PathBuf {
        self.root.join("sandboxes")
    }
    pub fn patches_dir(&self) -> PathBuf {
        self.root.join("patches")
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self { root: default_data_root() }
    }
}

/// The local LLM inference backend (chat + embeddings), out of scope except at its interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_chat_url")]
    pub chat_url: String,
    #[serde(default = "default_backend_embed_url")]
    pub embed_url: String,
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            chat_url: default_backend_chat_url(),
            embed_url: default_backend_embed_url(),
            timeout_secs: default_backend_timeout_secs(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

/// Legacy bearer-token verification (one leg of the auth waterfall).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_jwt_public_key_path")]
    pub public_key_path: PathBuf,
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            public_key_path: default_jwt_public_key_path(),
            algorithm: default_jwt_algorithm(),
            issuer: None,
            audience: None,
        }
    }
}

/// Per-tier quota limits (spec.md §4.3 quota gate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimits {
    pub chat_per_week: u64,
    pub chat_per_day: u64,
    pub image_per_week: u64,
    pub shell_per_hour: u64,
    pub file_edit_per_hour: u64,
    pub max_concurrent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiersConfig {
    pub free: TierLimits,
    pub pro: TierLimits,
    pub sovereign: TierLimits,
}

impl TiersConfig {
    pub fn for_tier(&self, tier: &str) -> &TierLimits {
        match tier {
            "pro" => &self.pro,
            "sovereign" => &self.sovereign,
            _ => &self.free,
        }
    }
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            free: TierLimits {
                chat_per_week: 200,
                chat_per_day: 40,
                image_per_week: 10,
                shell_per_hour: 0,
                file_edit_per_hour: 0,
                max_concurrent: 1,
            },
            pro: TierLimits {
                chat_per_week: 5_000,
                chat_per_day: 1_000,
                image_per_week: 200,
                shell_per_hour: 30,
                file_edit_per_hour: 60,
                max_concurrent: 4,
            },
            sovereign: TierLimits {
                chat_per_week: u64::MAX,
                chat_per_day: u64::MAX,
                image_per_week: u64::MAX,
                shell_per_hour: 240,
                file_edit_per_hour: 480,
                max_concurrent: 16,
            },
        }
    }
}

/// Anonymous guest-bucket window (spec.md §4.3 guest gate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestConfig {
    #[serde(default = "default_guest_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_guest_limit")]
    pub limit: u64,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            window_secs: default_guest_window_secs(),
            limit: default_guest_limit(),
        }
    }
}

/// Power-dial profile table (spec.md §4.5 capability router).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerProfile {
    pub context_tokens: u32,
    pub temperature: f32,
    pub reasoning: bool,
    pub speculative: bool,
    pub retrieval_top_k: u32,
    pub history_turns: u32,
    pub min_tier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    #[serde(default = "default_power_profiles")]
    pub profiles: HashMap<String, PowerProfile>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self { profiles: default_power_profiles() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub audit_all_requests: bool,
    #[serde(default = "default_true")]
    pub audit_auth_events: bool,
    #[serde(default)]
    pub signing_key_path: Option<PathBuf>,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default = "default_excluded_routes")]
    pub excluded_routes: Vec<String>,
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u32,
    #[serde(default)]
    pub syslog: SyslogConfig,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            audit_all_requests: false,
            audit_auth_events: true,
            signing_key_path: None,
            retention_days: Some(365),
            excluded_routes: default_excluded_routes(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
            syslog: SyslogConfig::default(),
        }
    }
}

/// Optional RFC 5424 syslog export for audit entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyslogConfig {
    /// "udp", "tcp", or "none"
    #[serde(default = "default_syslog_transport")]
    pub transport: String,
    #[serde(default = "default_syslog_address")]
    pub address: String,
    #[serde(default = "default_syslog_facility")]
    pub facility: u8,
    #[serde(default)]
    pub app_name: Option<String>,
}

impl Default for SyslogConfig {
    fn default() -> Self {
        Self {
            transport: default_syslog_transport(),
            address: default_syslog_address(),
            facility: default_syslog_facility(),
            app_name: None,
        }
    }
}

fn default_syslog_transport() -> String { "none".into() }
fn default_syslog_address() -> String { "127.0.0.1:514".into() }
fn default_syslog_facility() -> u8 { 13 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_slide_secs")]
    pub slide_secs: u64,
    #[serde(default = "default_abs_max_secs")]
    pub abs_max_secs: u64,
    #[serde(default = "default_inactivity_secs")]
    pub inactivity_secs: u64,
    #[serde(default)]
    pub legacy_token_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            slide_secs: default_slide_secs(),
            abs_max_secs: default_abs_max_secs(),
            inactivity_secs: default_inactivity_secs(),
            legacy_token_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self { keepalive_secs: default_keepalive_secs() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sidecar_url")]
    pub sidecar_url: String,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
    #[serde(default = "default_max_workspaces_per_user")]
    pub max_workspaces_per_user: u32,
    #[serde(default = "default_max_workspace_bytes")]
    pub max_workspace_bytes: u64,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sidecar_url: default_sidecar_url(),
            run_timeout_secs: default_run_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            max_workspaces_per_user: default_max_workspaces_per_user(),
            max_workspace_bytes: default_max_workspace_bytes(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_frontier_url")]
    pub provider_url: String,
    #[serde(default = "default_poh_threshold")]
    pub poh_threshold: f64,
    #[serde(default = "default_frontier_hourly_quota")]
    pub hourly_quota: u64,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider_url: default_frontier_url(),
            poh_threshold: default_poh_threshold(),
            hourly_quota: default_frontier_hourly_quota(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_candidates")]
    pub candidates: u32,
    #[serde(default = "default_min_tier_synthesis")]
    pub min_tier: String,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            candidates: default_candidates(),
            min_tier: default_min_tier_synthesis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalRateLimitConfig {
    #[serde(default = "default_requests_per_period")]
    pub requests_per_period: u32,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

impl Default for LocalRateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_period: default_requests_per_period(),
            period_secs: default_period_secs(),
            burst_size: default_burst_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
    #[serde(default = "default_true")]
    pub catch_panic: bool,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default = "default_cors_mode")]
    pub cors_mode: String,
    #[serde(default)]
    pub governor: LocalRateLimitConfig,
    #[serde(default)]
    pub security_headers: SecurityHeadersConfig,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            body_limit_mb: default_body_limit_mb(),
            catch_panic: true,
            compression: true,
            cors_mode: default_cors_mode(),
            governor: LocalRateLimitConfig::default(),
            security_headers: SecurityHeadersConfig::default(),
        }
    }
}

/// Standard HTTP security response headers applied to every response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityHeadersConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub hsts: bool,
    #[serde(default = "default_hsts_max_age")]
    pub hsts_max_age_secs: u64,
    #[serde(default)]
    pub hsts_include_subdomains: bool,
    #[serde(default)]
    pub hsts_preload: bool,
    #[serde(default = "default_true")]
    pub x_content_type_options: bool,
    #[serde(default = "default_frame_options")]
    pub x_frame_options: String,
    #[serde(default = "default_true")]
    pub x_xss_protection: bool,
    #[serde(default = "default_referrer_policy")]
    pub referrer_policy: String,
    #[serde(default)]
    pub permissions_policy: Option<String>,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hsts: true,
            hsts_max_age_secs: default_hsts_max_age(),
            hsts_include_subdomains: false,
            hsts_preload: false,
            x_content_type_options: true,
            x_frame_options: default_frame_options(),
            x_xss_protection: true,
            referrer_policy: default_referrer_policy(),
            permissions_policy: None,
        }
    }
}

fn default_hsts_max_age() -> u64 { 31_536_000 }
fn default_frame_options() -> String { "DENY".into() }
fn default_referrer_policy() -> String { "no-referrer".into() }

// ---- defaults ----

fn default_port() -> u16 { 8080 }
fn default_log_level() -> String { "info".into() }
fn default_timeout() -> u64 { 120 }
fn default_environment() -> String { "development".into() }
fn default_true() -> bool { true }
fn default_data_root() -> PathBuf { PathBuf::from("./data") }
fn default_backend_chat_url() -> String { "http://127.0.0.1:11434/api/chat".into() }
fn default_backend_embed_url() -> String { "http://127.0.0.1:11434/api/embeddings".into() }
fn default_backend_timeout_secs() -> u64 { 300 }
fn default_unhealthy_threshold() -> u32 { 5 }
fn default_jwt_public_key_path() -> PathBuf { PathBuf::from("./keys/jwt-public.pem") }
fn default_jwt_algorithm() -> String { "RS256".into() }
fn default_guest_window_secs() -> u64 { 86_400 }
fn default_guest_limit() -> u64 { 5 }
fn default_excluded_routes() -> Vec<String> {
    vec!["/api/health".into(), "/api/ready".into()]
}
fn default_cleanup_interval_hours() -> u32 { 24 }
fn default_cookie_name() -> String { "kuro_sid".into() }
fn default_slide_secs() -> u64 { 3_600 }
fn default_abs_max_secs() -> u64 { 30 * 24 * 3_600 }
fn default_inactivity_secs() -> u64 { 7_200 }
fn default_keepalive_secs() -> u64 { 15 }
fn default_sidecar_url() -> String { "http://127.0.0.1:9090".into() }
fn default_run_timeout_secs() -> u64 { 30 }
fn default_max_output_bytes() -> u64 { 2 * 1024 * 1024 }
fn default_max_workspaces_per_user() -> u32 { 10 }
fn default_max_workspace_bytes() -> u64 { 256 * 1024 * 1024 }
fn default_max_file_bytes() -> u64 { 32 * 1024 * 1024 }
fn default_frontier_url() -> String { "https://frontier.invalid/v1/chat".into() }
fn default_poh_threshold() -> f64 { 0.35 }
fn default_frontier_hourly_quota() -> u64 { 20 }
fn default_candidates() -> u32 { 3 }
fn default_min_tier_synthesis() -> String { "sovereign".into() }
fn default_requests_per_period() -> u32 { 120 }
fn default_period_secs() -> u64 { 60 }
fn default_burst_size() -> u32 { 20 }
fn default_body_limit_mb() -> usize { 25 }
fn default_cors_mode() -> String { "restrictive".into() }

fn default_power_profiles() -> HashMap<String, PowerProfile> {
    let mut m = HashMap::new();
    m.insert(
        "instant".into(),
        PowerProfile {
            context_tokens: 2_048,
            temperature: 0.7,
            reasoning: false,
            speculative: false,
            retrieval_top_k: 3,
            history_turns: 4,
            min_tier: "free".into(),
        },
    );
    m.insert(
        "balanced".into(),
        PowerProfile {
            context_tokens: 8_192,
            temperature: 0.6,
            reasoning: true,
            speculative: false,
            retrieval_top_k: 6,
            history_turns: 12,
            min_tier: "pro".into(),
        },
    );
    m.insert(
        "deep".into(),
        PowerProfile {
            context_tokens: 32_768,
            temperature: 0.4,
            reasoning: true,
            speculative: true,
            retrieval_top_k: 12,
            history_turns: 40,
            min_tier: "sovereign".into(),
        },
    );
    m
}

impl Config {
    /// Load configuration, inferring the service name from the binary name.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "gateway".to_string());
        Self::load_for_service(&service_name)
    }

    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("GATEWAY_").split("__"));

        Ok(figment.extract()?)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("GATEWAY_").split("__"))
            .extract()?;
        Ok(config)
    }

    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        paths.push(PathBuf::from("config.toml"));

        let xdg_dirs = xdg::BaseDirectories::with_prefix("gateway");
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Ok(path) = xdg_dirs.place_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc/gateway").join(service_name).join("config.toml"));
        paths
    }

    pub fn tier_limits(&self, tier: &str) -> &TierLimits {
        match tier {
            "pro" => &self.tiers.pro,
            "sovereign" => &self.tiers.sovereign,
            _ => &self.tiers.free,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "gateway".to_string(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                environment: default_environment(),
            },
            data: DataConfig::default(),
            backend: BackendConfig::default(),
            jwt: JwtConfig::default(),
            tiers: TiersConfig::default(),
            guest: GuestConfig::default(),
            capability: CapabilityConfig::default(),
            audit: AuditConfig::default(),
            session: SessionConfig::default(),
            sse: SseConfig::default(),
            sandbox: SandboxConfig::default(),
            frontier: FrontierConfig::default(),
            synthesis: SynthesisConfig::default(),
            middleware: MiddlewareConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_ports_and_tiers() {
        let config = Config::default();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.tiers.free.chat_per_day, 40);
        assert!(config.tiers.sovereign.chat_per_week > config.tiers.pro.chat_per_week);
    }

    #[test]
    fn capability_profiles_carry_tier_ceilings() {
        let config = Config::default();
        let deep = config.capability.profiles.get("deep").unwrap();
        assert_eq!(deep.min_tier, "sovereign");
    }
}
