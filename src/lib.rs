//! Purpose: Library crate behind the `search-data-extractor` binary and its tests.
//! Exports: `api` (stable surface), `config` (extractor config files), `data_dir` (JSON record store loader).
//! Role: Keeps gate and export semantics independent of the HTTP server.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
mod core;

pub mod api;
pub mod config;
pub mod data_dir;
