//! HTTP API route handlers.

pub mod admin;
pub mod speed;
pub mod system;
pub mod websocket;
