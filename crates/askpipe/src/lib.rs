//! `askpipe`: a conversational web-research pipeline.
//!
//! [`Pipeline::run`] plans, retrieves, filters, synthesizes, quality-checks and
//! persists one turn of a conversation. Collaborators come from `askpipe-core`
//! traits; `askpipe-local` has the concrete ones the CLI uses.

pub mod config;
pub mod pipeline;

pub use config::{ConfigError, PipelineConfig};
pub use pipeline::{Pipeline, RunOutcome, RunRequest};
