pub mod config;
pub mod emitter;
pub mod error;
pub mod handler;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod server;
pub mod sse;
pub mod telemetry;
pub mod upstream;
