pub mod auth;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use gateway::{Dispatcher, Server};

/// Shared state for control-plane handlers.
#[derive(Clone)]
pub struct AppState {
    pub server: Arc<Server>,
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            dispatcher: Dispatcher::new(server.clone()),
            server,
        }
    }
}
