pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod realtime;
pub mod redis_client;
pub mod services;
pub mod store;
