//! Configuration and the shared data model

pub mod config;
pub mod models;
