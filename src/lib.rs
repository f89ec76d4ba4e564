//! Process-tree snapshot ingest server library

pub mod app;
pub mod config;
pub mod ingest;
pub mod store;
pub mod web;

mod prelude;
