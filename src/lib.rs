pub mod app;
pub mod chat;
pub mod config;
pub mod error;
pub mod handlers;
pub mod markdown;
pub mod model_catalog;
pub mod relay;
pub mod sse;
pub mod upstream;
