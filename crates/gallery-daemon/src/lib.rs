//! HTTP surface and process wiring for the gallery pipeline.

pub mod server;
pub mod telemetry;
