pub mod app;
pub mod batch;
pub mod cancel;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod executor;
pub mod fetch_policy;
pub mod ftp;
pub mod output;
pub mod rate_limit;
pub mod report;
pub mod retriever;
pub mod scheduler;
pub mod services;
pub mod source;
pub mod store;
pub mod strategy;
pub mod transport;
