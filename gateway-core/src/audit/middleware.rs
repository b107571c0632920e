//! Axum middleware that audits HTTP requests.
//!
//! Applied globally by the router; per-route annotation (`audit_layer`)
//! overrides the generated action name so handlers can ask for an
//! audit entry with domain-meaningful naming (`"conversation.delete"`
//! instead of `"http.request"`).

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

use super::event::{AuditEntry, AuditResult};
use super::logger::AuditLogger;

#[derive(Clone, Debug)]
pub struct AuditRoute {
    pub name: String,
}

impl AuditRoute {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

pub fn audit_layer(name: &str) -> axum::Extension<AuditRoute> {
    axum::Extension(AuditRoute::new(name))
}

/// Global audit middleware: records every request unless it matches an
/// excluded route pattern and isn't annotated with [`AuditRoute`].
pub async fn audit_middleware(
    State(logger): State<std::sync::Arc<AuditLogger>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let audit_route = request.extensions().get::<AuditRoute>().cloned();

    let should_audit = if audit_route.is_some() {
        true
    } else {
        let config = logger.config();
        if path_matches_patterns(&path, &config.excluded_routes) {
            false
        } else {
            config.audit_all_requests
        }
    };

    if !should_audit {
        return next.run(request).await;
    }

    let client_fingerprint = request
        .headers()
        .get("x-forwarded-for")
        .or_else(|| request.headers().get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string());

    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let user_id = request
        .extensions()
        .get::<crate::middleware::Claims>()
        .map(|c| c.sub.clone());

    let action = audit_route
        .as_ref()
        .map(|r| r.name.clone())
        .unwrap_or_else(|| format!("http.{}", method.to_lowercase()));

    let start = Instant::now();
    let response = next.run(request).await;
    let duration_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    let result = if status >= 500 {
        AuditResult::Error
    } else if status >= 400 {
        AuditResult::Denied
    } else {
        AuditResult::Ok
    };

    let mut entry = AuditEntry::new("http", action, result)
        .with_target(path.clone())
        .with_meta(serde_json::json!({
            "method": method,
            "path": path,
            "status": status,
            "duration_ms": duration_ms,
        }));
    if let Some(fp) = client_fingerprint {
        entry = entry.with_client_fingerprint(fp);
    }
    if let Some(rid) = request_id {
        entry = entry.with_request_id(rid);
    }
    if let Some(uid) = user_id {
        entry = entry.with_user_id(uid);
    }

    if let Err(e) = logger.log(entry).await {
        tracing::error!(error = %e, "failed to persist audit entry");
    }

    response
}

pub fn path_matches_patterns(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| path_matches_glob(path, pattern))
}

fn path_matches_glob(path: &str, pattern: &str) -> bool {
    if path == pattern {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path.starts_with(prefix) && path.len() > prefix.len();
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return path.starts_with(prefix);
    }
    if pattern.contains('*') {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 2 {
            return path.starts_with(parts[0]) && path.ends_with(parts[1]);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_matches_exact() {
        assert!(path_matches_glob("/api/v1/users", "/api/v1/users"));
        assert!(!path_matches_glob("/api/v1/users", "/api/v1/posts"));
    }

    #[test]
    fn path_matches_trailing_wildcard() {
        assert!(path_matches_glob("/api/v1/admin/users", "/api/v1/admin/*"));
        assert!(path_matches_glob("/api/v1/admin/settings", "/api/v1/admin/*"));
        assert!(!path_matches_glob("/api/v1/users", "/api/v1/admin/*"));
    }

    #[test]
    fn path_matches_double_wildcard() {
        assert!(path_matches_glob("/api/v1/admin/users/123", "/api/v1/admin/**"));
        assert!(path_matches_glob("/api/v1/admin", "/api/v1/admin/**"));
    }

    #[test]
    fn path_matches_patterns_list() {
        let patterns = vec!["/api/v1/admin/*".to_string(), "/api/v1/users/*/delete".to_string()];
        assert!(path_matches_patterns("/api/v1/admin/settings", &patterns));
        assert!(path_matches_patterns("/api/v1/users/123/delete", &patterns));
        assert!(!path_matches_patterns("/api/v1/posts", &patterns));
    }
}
