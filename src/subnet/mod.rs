pub mod config;
mod manager;
mod subnet;

pub use manager::*;
pub use subnet::*;
