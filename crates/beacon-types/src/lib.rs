pub mod event;
pub mod properties;
pub mod inbound;
pub mod config;
pub mod error;
pub mod session;


pub use error::{BeaconError, DeliveryError};
pub type Result<T> = std::result::Result<T, BeaconError>;
