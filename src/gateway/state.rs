use std::sync::Arc;

use crate::engine::Engine;

/// Shared gateway state: the engine facade plus the auth settings.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub api_key: String,
    pub auth_disabled: bool,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, api_key: String, auth_disabled: bool) -> Self {
        Self {
            engine,
            api_key,
            auth_disabled,
        }
    }
}
