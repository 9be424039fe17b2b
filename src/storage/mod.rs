pub mod db;
mod references;
mod tables;

pub use db::{Database, DatabaseError};
pub use tables::*;
