pub mod config;
pub mod package;
pub mod platform;
pub mod project;
