use std::sync::Mutex;

use crate::error::{BatchError, Result};

/// A first-error status cell shared between the split pieces of one
/// submission and the completion barrier that reads it.
///
/// Updates with an `Ok` status are no-ops; the first non-OK status wins and
/// later errors are dropped.
#[derive(Debug, Default)]
pub struct SharedStatus {
    inner: Mutex<Option<BatchError>>,
}

impl SharedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retains the first error: replaces the current status with `status`
    /// only if `status` is an error and no error has been recorded yet.
    pub fn update(&self, status: Result<()>) {
        let Err(error) = status else {
            return;
        };
        let mut guard = self.inner.lock().unwrap();
        if guard.is_none() {
            *guard = Some(error);
        }
    }

    pub fn is_ok(&self) -> bool {
        self.inner.lock().unwrap().is_none()
    }

    /// The retained status.
    pub fn result(&self) -> Result<()> {
        match &*self.inner.lock().unwrap() {
            None => Ok(()),
            Some(error) => Err(error.clone()),
        }
    }
}
