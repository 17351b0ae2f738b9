//! Shared type definitions for the Murmur social backend.
//!
//! This crate is the single source of truth for identifiers and domain
//! structs used across the workspace. Types flow to `TypeScript` via `ts-rs`
//! for API consumers.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for all entity identifiers
//! - [`models`] -- Users, profiles, posts, comments, timeline items and
//!   toggle results

pub mod ids;
pub mod models;

// Re-export all public types at crate root for convenience.
pub use ids::{CommentId, PostId, TimelineItemId, UserId};
pub use models::{
    Comment, NewPost, Post, TimelineItem, ToggleFollowOutput, ToggleLikeOutput, User, UserProfile,
};
