pub mod cli;
pub mod commands;
pub mod config;
pub mod doctor;
pub mod errors;
pub mod keyring;
pub mod operations;
pub mod output;
