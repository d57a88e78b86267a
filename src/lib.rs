pub mod api;
pub mod assets;
pub mod auth;
pub mod client;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod ratelimit;
pub mod telemetry;
pub mod tracker;
