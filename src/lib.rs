pub mod classifier;
pub mod config;
pub mod engine;
pub mod fetch;
pub mod ingest;
pub mod model;
pub mod output;
pub mod parser;
pub mod schedule;
pub mod signals;
pub mod summary;
pub mod timeline;
