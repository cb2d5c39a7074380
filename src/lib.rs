pub mod blob;
pub mod build;
pub mod config;
pub mod error;
pub mod host;
pub mod lock;
pub mod outbox;
pub mod pipeline;
pub mod platform;
pub mod shutdown;
pub mod store;
