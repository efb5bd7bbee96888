// Library root: re-exports all modules so integration tests and external
// consumers can access the crate's public API.

pub mod ai;
pub mod app;
pub mod config;
pub mod connections;
pub mod crm;
pub mod db;
pub mod enrichment;
pub mod followup;
pub mod models;
pub mod outbound;
pub mod pipeline;
pub mod sending;
pub mod sources;
