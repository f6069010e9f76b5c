//! Core crate for framefix: frame stores, interpolation tasks and the HTTP API.

pub mod config;
pub mod dispatcher;
pub mod extract;
pub mod frame_store;
pub mod interpolator;
pub mod logging;
pub mod queue;
pub mod repos;
pub mod runtime;
pub mod server;
pub mod status;
pub mod task;
pub mod worker;
