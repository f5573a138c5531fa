//! Metadata job engine and merge engine for a visual-novel catalog.
//!
//! Jobs fetch game, person and character data from several providers,
//! merge the fragments into canonical records and keep a deduplicated
//! roster of people. See [`jobs::JobScheduler`] for the entry point.

pub mod config;
pub mod error;
pub mod jobs;
pub mod models;
pub mod services;

#[cfg(test)]
mod test_support;
