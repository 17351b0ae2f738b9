//! Write and consistency engine for the Murmur social backend.
//!
//! Every request goes through [`SocialService`]. Follow and like toggles
//! run in row-locked transactions that keep the denormalized counters in
//! step with the relationship rows; new posts are committed together with
//! the author's timeline entry and then copied into followers' timelines
//! by a bounded worker pool.
//!
//! # Modules
//!
//! - [`service`] -- [`SocialService`], the request-facing entry point.
//! - [`toggle`] -- [`ToggleEngine`]: follow/like toggles with one retry on
//!   conflict.
//! - [`fanout`] -- [`FanoutPool`] workers, submission handle, stats and
//!   delivery events.
//! - [`audit`] -- counter drift detection and repair.
//! - [`validate`] -- input normalization and bounds.
//! - [`config`] -- `murmur-config.yaml` loading with environment overrides.
//! - [`error`] -- [`SocialError`] and its client-facing messages.
//!
//! [`ToggleEngine`]: toggle::ToggleEngine
//! [`FanoutPool`]: fanout::FanoutPool

pub mod audit;
mod comments;
pub mod config;
pub mod error;
pub mod fanout;
mod posts;
pub mod service;
pub mod toggle;
mod transaction;
mod users;
pub mod validate;

pub use audit::{AuditReport, CounterAudit};
pub use config::MurmurConfig;
pub use error::SocialError;
pub use fanout::{FanoutError, FanoutEvent, FanoutHandle, FanoutPool, FanoutStatsSnapshot};
pub use service::SocialService;
