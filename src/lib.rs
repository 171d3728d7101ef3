pub mod api;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod groups;
pub mod hardware;
pub mod optimizer;
pub mod telemetry;
