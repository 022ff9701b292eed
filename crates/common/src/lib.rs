//! Shared types for the audit integration gateway

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
