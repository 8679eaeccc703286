//! Common types for the generation gateway

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
