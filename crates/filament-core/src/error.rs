//! Runtime error taxonomy.
//!
//! Only resource exhaustion is reported to callers (`spawn`, thread-local
//! slot creation). Programming-contract violations are fatal assertions and
//! impossible OS failures abort the process; neither appears here.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The OS could not create a thread.
    #[error("thread spawn failed: {0}")]
    Spawn(#[from] io::Error),
    /// All thread-local storage slots are in use.
    #[error("thread-local slot registry exhausted")]
    TlsExhausted,
}
