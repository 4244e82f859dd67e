use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::error::{PingpongError, Result};

/// Shared stop flag checked by every spin loop of a run.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_raised() { Err(PingpongError::Aborted) } else { Ok(()) }
    }
}
