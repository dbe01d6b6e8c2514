pub mod config;
pub mod envsubst;
pub mod error;
pub mod events;
pub mod mockdb;
pub mod models;
pub mod observability;
pub mod storage;
