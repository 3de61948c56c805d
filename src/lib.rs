pub mod builder;
pub mod cli;
pub mod config;
pub mod constants;
pub mod health;
pub mod launch;
pub mod manifest;
pub mod pipeline;
pub mod profile;
pub mod recipe;
pub mod runtime_env;
pub mod service;

pub use anyhow::Result;
