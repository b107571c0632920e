//! File-backed HTTP session store (spec.md §4.1 auth waterfall, leg one:
//! "a session cookie issued at login, sliding `slide_secs`, hard-capped at
//! `abs_max_secs`").
//!
//! Session records are plain JSON files under `<data_root>/sessions/`, one
//! per session id, matching the audit module's append-only-files design
//! rather than pulling in a session-store crate the rest of the stack
//! doesn't otherwise need (see DESIGN.md).

mod csrf;
mod extractors;
mod store;

pub use csrf::{verify_csrf, CsrfToken};
pub use extractors::{OptionalSession, TypedSession};
pub use store::{SessionRecord, SessionStore};
