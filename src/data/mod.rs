//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite database operations
//! - Row models for users, posts and federation state

mod database;
mod models;

pub use database::Database;
pub use models::*;

#[cfg(test)]
mod database_test;
