pub mod config;
pub mod models;
pub mod service;

pub use config::{AiBackend, ServiceConfig};
pub use service::{AppState, SessionEntry, build_router, create_app, spawn_idle_sweeper};
