//! Core library for the sovereign multi-tenant AI gateway.
//!
//! Request flow: auth waterfall (session cookie → legacy JWT → anonymous
//! guest) → quota/guest gate → capability router (power dial) → pipeline
//! (validate → retrieve → synthesize/stream) → audit log on every
//! consequential action. See `SPEC_FULL.md` for the full module map.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gateway_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     let state = AppState::build(config.clone()).await?;
//!     let app = gateway_core::routes::router(state);
//!     Server::new(config).serve(app).await?;
//!     Ok(())
//! }
//! ```

pub mod agents;
pub mod audit;
pub mod capability;
pub mod config;
pub mod connectors;
pub mod error;
pub mod frontier;
pub mod ids;
pub mod middleware;
pub mod orchestrator;
pub mod pipeline;
pub mod quota;
pub mod responses;
pub mod retrieval;
pub mod routes;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod sse;
pub mod state;
pub mod synthesis;
pub mod vector_store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::ids::{prefixed_id, MakeTypedRequestId, RequestId, RequestIdError};

    pub use crate::middleware::{
        extract_token, request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
        Claims, GovernorRateLimit, JwtAuth, RequestTrackingConfig, TokenValidator,
        PROPAGATE_HEADERS, SENSITIVE_HEADERS,
    };

    pub use crate::server::Server;
    pub use crate::state::AppState;

    pub use crate::responses::{Accepted, Conflict, Created, FieldError, NoContent, Success, ValidationError};

    pub use crate::audit::{AuditEntry, AuditLogger, AuditResult};

    pub use crate::session::{CsrfToken, SessionStore, TypedSession};

    pub use crate::sse::{SseBroadcaster, SseConnection};

    pub use crate::agents::{BackgroundWorker, HealthStatus, TaskStatus};

    pub use crate::quota::{QuotaAction, QuotaService, QuotaStatus};

    pub use crate::vector_store::{Namespace, VectorStore};

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Extension, Router,
    };

    pub use serde::{Deserialize, Serialize};
    pub use tracing::{debug, error, info, instrument, trace, warn, Level, Span};
    pub use tokio;
    pub use async_trait::async_trait;
    pub use thiserror::Error;
    pub use anyhow::{self, Context as AnyhowContext};
    pub use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
    pub use uuid::Uuid;
    pub use futures::{future, stream, Future, Stream, StreamExt, TryFutureExt, TryStreamExt};
    pub use http::{Method, Uri};
}
