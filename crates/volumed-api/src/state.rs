use std::sync::Arc;

use volumed_engine::OperationEngine;
use volumed_store::StateStore;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<OperationEngine>,
    pub store: Arc<dyn StateStore>,
    pub auth_token: Option<Arc<String>>,
}
