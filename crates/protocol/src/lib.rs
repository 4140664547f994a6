pub mod config;
pub mod messages;

pub use config::*;
pub use messages::*;
