pub mod api;
pub mod config;
pub mod cron;
pub mod errors;
pub mod oauth;
pub mod routes;
pub mod server;
pub mod setup;
pub mod state;
pub mod static_assets;
pub mod store;
pub mod summary;
pub mod traits;
