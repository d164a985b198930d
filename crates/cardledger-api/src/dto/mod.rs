//! Data Transfer Objects (DTOs) for API requests and responses

pub mod authorization;
pub mod webhook;

pub use authorization::*;
pub use webhook::*;
