pub mod audit;
pub mod config;
pub mod db;
pub mod detection;
pub mod error;
pub mod graph;
pub mod ingest;
pub mod service;
pub mod types;
