//! Chat agent server that routes tool calls through in-process tools and
//! isolated sandbox sessions.

pub mod agent;
pub mod cli;
pub mod config;
pub mod llm;
pub mod router;
pub mod sandbox;
pub mod service;
pub mod tools;
