pub mod cli;
pub mod env;
pub mod error;
pub mod format;
pub mod poll;
pub mod setup;
