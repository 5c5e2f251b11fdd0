//! Centralized error handling for the emby-proxy application.
//!
//! Unifies error types across the HTTP client, drive client, cache, playlist
//! manager, and route handlers behind a single [`AppError`] enum, so every
//! handler can propagate with `?` and let `proxy-error-strategy` decide the
//! client-facing outcome.

pub mod types;

pub use types::*;

/// Convenience type alias for Results using [`AppError`].
pub type AppResult<T> = Result<T, AppError>;
