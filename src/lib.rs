pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod relay;
pub mod tools;
pub mod upstream;
pub mod usage;
