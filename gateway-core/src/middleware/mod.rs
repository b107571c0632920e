//! Middleware: auth, rate limiting, request tracking, security headers.

pub mod governor;
pub mod jwt;
pub mod request_tracking;
pub mod security_headers;
pub mod token;

pub use governor::GovernorRateLimit;
pub use jwt::JwtAuth;
pub use request_tracking::{
    request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
    RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
};
pub use security_headers::apply_security_headers;
pub use token::{extract_token, Claims, TokenValidator};
