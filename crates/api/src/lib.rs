//! HTTP surface: server bootstrap, routing, and request/response mapping.

pub mod app;
pub mod config;
pub mod middleware;
pub mod ratelimit;
