//! API module
//!
//! This module provides the API functionality for the wbs-engine service,
//! including the server and client.

pub mod client;
pub mod server;

// Re-export commonly used types
pub use client::{Client, ClientConfig, ClientError};
pub use server::{router, serve, ServerConfig};
