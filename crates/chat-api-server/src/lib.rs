pub mod cache;
pub mod config;
pub mod database;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;
