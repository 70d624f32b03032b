//! Route handlers for the HTTP API
//!
//! - [`fetch`]: the download endpoint
//! - [`system`]: health, events, OpenAPI

mod fetch;
mod system;

pub use fetch::*;
pub use system::*;
