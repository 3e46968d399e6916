pub mod blob;
pub mod config;
pub mod error;
pub mod login;
