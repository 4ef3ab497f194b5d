pub mod config;
pub mod error;
pub mod signal;

pub mod models;
pub mod services;
pub mod storage;
