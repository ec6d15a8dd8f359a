pub mod config;
pub mod probe;
pub mod registry;
pub mod server;
pub mod telemetry;
