pub mod cache;
pub mod config;
pub mod layers;
pub mod models;
pub mod ops;
