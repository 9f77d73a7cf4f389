use crate::{store::ChatStore, websocket::Gateway};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub store: Arc<dyn ChatStore>,
}
