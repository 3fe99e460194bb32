pub mod api;
pub mod checkpoint;
pub mod cli;
pub mod crawl;
pub mod error;
pub mod models;
pub mod record;
pub mod services;
pub mod settings;
