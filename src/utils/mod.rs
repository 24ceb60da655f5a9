//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod timer;

pub use bitmap::PartitionSet;
pub use error::{DomainError, GridError};
pub use print::{logger_init, ME};
pub use timer::Timer;
