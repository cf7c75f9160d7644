pub mod config;
pub mod exec;
pub mod health;
pub mod ingest;
pub mod rollup;
pub mod schedule;
pub mod service;
pub mod writer;
