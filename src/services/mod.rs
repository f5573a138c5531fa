// Services module - identity matching, merging and the provider layer

pub mod identity;
pub mod merge;
pub mod people;
pub mod sources;
pub mod store;

// Metadata providers
pub mod offline_db;
