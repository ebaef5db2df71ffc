pub mod backends;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod portal;
pub mod routes;
pub mod services;
