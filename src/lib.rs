// ============================================================================
// File: src/lib.rs
// Crate root: the recommendation pipeline and its HTTP surface
// ============================================================================

pub mod auth;
pub mod catalog;
pub mod config;
pub mod criteria;
pub mod email;
pub mod error;
pub mod llm_client;
pub mod models;
pub mod orchestrator;
pub mod payment;
pub mod response;
pub mod search_client;
pub mod selector;
pub mod server;
pub mod vehicle;
