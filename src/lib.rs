pub mod app;
pub mod config;
pub mod shared;
pub mod terraform;
pub mod workspace;
