//! Infrastructure layer: job storage, execution, collaborators, config.

pub mod config;
pub mod context;
pub mod jobs;
pub mod notify;
