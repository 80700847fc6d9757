//! # IPC transport memory
//!
//! The byte store behind stream and datagram channels. Each endpoint owns
//! one [`MBufChain`]; producers append through the write operations and
//! consumers drain through read, with peek available for non-destructive
//! inspection. A chain carries either stream bytes or whole datagrams for
//! its entire life; the two must never be mixed in one instance.
//!
//! The chain is passive data. The dispatcher that multiplexes endpoints is
//! expected to hold one lock per endpoint around every call and to turn the
//! [`ChainError`] values into its own signaling and re-queueing policy.

mod chain;

pub use chain::{mbuf_total_bytes, MBufChain, CHAIN_CAPACITY, MBUF_PAYLOAD_SIZE};

/// Errors returned by [`MBufChain`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainError {
    /// Zero-length datagram, or the user buffer faulted while a datagram
    /// was being built (the chain was left unmodified)
    InvalidArgument,
    /// Datagram longer than a chain can ever hold
    OutOfRange,
    /// No space or no frames right now; retry after a read drains the chain
    WouldBlock,
    /// A user copy faulted mid-operation
    Fault {
        /// Bytes successfully transferred before the fault.
        complete: usize,
    },
}
