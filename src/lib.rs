pub mod api;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod integration;
pub mod queue;
pub mod rate_limit;
pub mod webhook;
