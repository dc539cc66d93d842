//! Crate containing common types and helpers used by the NSFS object store

#[macro_use]
extern crate tracing;

pub mod config;
pub mod data;
pub mod error;
pub mod time;
