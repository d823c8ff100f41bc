use crate::error::{Error, Fatal};
use std::fmt;
use std::sync::Arc;
use tracing::error;

type Hook = dyn Fn(&Fatal) + Send + Sync;

/// The abort path for [`Fatal`] conditions.
///
/// The production handler never returns. A handler that does return (tests)
/// lets the caller see the condition as an ordinary `Error::Fatal`.
#[derive(Clone)]
pub struct FatalHandler {
    hook: Arc<Hook>,
}

impl FatalHandler {
    pub fn new(hook: impl Fn(&Fatal) + Send + Sync + 'static) -> Self {
        Self {
            hook: Arc::new(hook),
        }
    }

    /// Logs the condition and aborts the process.
    pub fn abort_process() -> Self {
        Self::new(|_| std::process::abort())
    }

    pub fn trigger(&self, fatal: &Fatal) {
        error!(error = %fatal, "unrecoverable registry failure");
        (self.hook)(fatal);
    }

    /// Passes `result` through, triggering the handler first if it carries a
    /// fatal error.
    pub fn check<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(Error::Fatal(fatal)) = &result {
            self.trigger(fatal);
        }
        result
    }
}

impl Default for FatalHandler {
    fn default() -> Self {
        Self::abort_process()
    }
}

impl fmt::Debug for FatalHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatalHandler").finish_non_exhaustive()
    }
}
