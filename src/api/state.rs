use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::api::auth::admin_token_fingerprint;
use crate::api::types::{ApiError, ErrorCode};
use crate::bootstrap::WardenContext;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<WardenContext>,
    /// sha256 of the admin token; `None` leaves mutating endpoints open
    pub admin_fingerprint: Option<Arc<str>>,
    /// Cleared when shutdown begins
    accepting: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(ctx: Arc<WardenContext>) -> Self {
        let admin_fingerprint = ctx
            .config
            .admin_token()
            .map(|token| Arc::from(admin_token_fingerprint(&token)));
        Self {
            ctx,
            admin_fingerprint,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn stop_intake(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn ensure_accepting(&self) -> std::result::Result<(), ApiError> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ApiError::new(
                ErrorCode::ShuttingDown,
                "shutdown in progress; control requests are refused",
            ))
        }
    }
}
