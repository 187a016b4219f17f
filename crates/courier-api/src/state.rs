use std::sync::Arc;

use courier_core::{Courier, TokenVerifier};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub courier: Courier,
    pub verifier: TokenVerifier,
}

impl AppStateInner {
    pub fn new(courier: Courier, verifier: TokenVerifier) -> AppState {
        Arc::new(Self { courier, verifier })
    }
}
