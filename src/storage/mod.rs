pub mod db;
mod files;
pub(crate) mod index;
pub mod models;
mod tables;

pub use db::{Database, DatabaseError};
pub use tables::*;
