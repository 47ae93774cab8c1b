pub mod app;
pub mod client;
pub mod config;
pub mod errors;
pub mod store;
