//! HTTP API handlers for kwp-ai

pub mod batches;
pub mod health;

pub use batches::batch_routes;
pub use health::health_routes;
