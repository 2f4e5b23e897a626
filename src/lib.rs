//! Distributed evaluation core of an online judge: a manager node that
//! queues judgments and dispatches them over a heartbeat-tracked executor
//! fleet, executor nodes that build submissions against cached CMake
//! templates, and a Clang-based extractor that returns the verbatim source
//! of required function implementations.

pub mod client;
pub mod config;
pub mod executor;
pub mod extractor;
pub mod manager;
pub mod opt;
