//! Tiered caching of GitHub repository analytics and contributor avatars.
//!
//! Lookups go through memory, a local fallback store, a shared durable store
//! and finally GitHub, with concurrent requests for the same key sharing one
//! origin fetch.

pub mod cache;
pub mod config;
pub mod error;
pub mod github;
pub mod logging;
pub mod service;
