pub mod bridge;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod kb_client;
pub mod models;
pub mod server;
pub mod session;
pub mod sources;

pub use config::AppConfig;
pub use server::run_server;
