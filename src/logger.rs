//! Host-pluggable diagnostic logging.
//!
//! The lock manager never panics or prints on its own; it calls back into
//! a `Logger` with the severity tags from the external-interfaces section.
//! [`DefaultLogger`] forwards to the `log` facade so embedders that already
//! initialize a `log` backend get diagnostics for free.

/// Diagnostic sink. Implementations must be cheap to call — they run while
/// the registry mutex or a CAS retry loop may still be live on the stack.
pub trait Logger: Send + Sync {
    /// A crashed client's slot was recovered and its locks scrubbed.
    fn notice(&self, msg: &str);
    /// A whole additional second of writer time has accumulated.
    fn warning(&self, msg: &str);
    /// A lock request failed with a genuine, unrecoverable conflict.
    fn busy_deadlock(&self, msg: &str);
    /// The HMA file could not be opened, sized, or mapped.
    fn cant_open(&self, msg: &str);
}

/// Forwards every call to the `log` crate, tagged with the severity string
/// from the spec so it is greppable in host application logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLogger;

impl Logger for DefaultLogger {
    fn notice(&self, msg: &str) {
        log::info!("NOTICE: {msg}");
    }

    fn warning(&self, msg: &str) {
        log::warn!("WARNING: {msg}");
    }

    fn busy_deadlock(&self, msg: &str) {
        log::error!("BUSY_DEADLOCK: {msg}");
    }

    fn cant_open(&self, msg: &str) {
        log::error!("CANTOPEN: {msg}");
    }
}
