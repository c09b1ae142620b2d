//! Performance testing for LLM endpoints.
//!
//! The `engine` daemon polls a task store, supervises generator process
//! groups, and persists per-run latency and token-throughput results. The
//! `generate` process hosts the virtual users that drive the actual load,
//! streaming or single-shot, OpenAI-shaped or field-map driven.

pub mod client;
pub mod cmd;
pub mod config;
pub mod coordinator;
pub mod dataset;
pub mod dispatcher;
pub mod errors;
pub mod fieldmap;
pub mod metrics;
pub mod payload;
pub mod prelude;
pub mod proc;
pub mod results;
pub mod sse;
pub mod store;
pub mod supervisor;
pub mod tokenizer;
pub mod user;
pub mod worker;
