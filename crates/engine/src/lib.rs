//! Detector engine process: configuration, component assembly and the HTTP API

pub mod api;
pub mod config;
pub mod runtime;
