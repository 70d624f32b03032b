//! Application state for the API server

use crate::FetchBroker;
use std::sync::Arc;

/// Shared application state accessible to all route handlers
///
/// Cloned for each request (cheap Arc clone).
#[derive(Clone)]
pub struct AppState {
    /// The broker serving fetch requests
    pub broker: Arc<FetchBroker>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(broker: Arc<FetchBroker>) -> Self {
        Self { broker }
    }
}
