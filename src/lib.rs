pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod gate;
pub mod rebalancer;
pub mod session;

pub use client::Client;
pub use config::Config;
pub use controller::Controller;
pub use error::{ClientError, ControllerError, Result};

// Re-export key types from workspace crates
pub use network;
pub use placement;
pub use storage;
