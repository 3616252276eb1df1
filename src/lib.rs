pub mod api;
pub mod broker;
pub mod clients;
pub mod config;
pub mod models;
pub mod providers;
pub mod repository;
pub mod services;
pub mod telemetry;
pub mod utils;
pub mod worker;
