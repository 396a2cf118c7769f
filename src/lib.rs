//! This crate contains the lifecycle engine of cfscope.
//!
//! It manages application and session scopes for a descriptor and drives
//! each request through the descriptor's lifecycle callbacks.

pub mod app;
pub mod config;
pub mod core;
pub mod pipeline;
pub mod registry;
pub mod scope;
pub mod service;
pub mod utils;
