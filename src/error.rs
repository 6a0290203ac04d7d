//! Crate-wide error type.
//!
//! Flat enum in the style of the grounding corpus's `MCIHostError`: no
//! `thiserror`, no nested causes, just the kinds a caller needs to branch on.

/// Error kinds surfaced by the core protocol/state engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No card present, or the card descriptor is empty (never probed, or
    /// probed and since ejected).
    NoDevice,
    /// Card failed to return to the `tran` state within the busy-poll
    /// deadline.
    NotReady,
    /// A host event wait expired.
    Timeout,
    /// A command response carried an error bit, an unexpected card state,
    /// or the host signaled a transfer error.
    IoError,
    /// The card reports `CARD_IS_LOCKED`; writes are refused before any bus
    /// activity.
    Locked,
    /// The card or host reports write-protection.
    WriteProtected,
    /// Argument out of range, unsupported passthrough opcode,
    /// reference-count saturation, or a `verify_state` mismatch.
    Invalid,
    /// The DMA alignment bounce buffer could not be allocated.
    OutOfMemory,
}

/// Result alias matching the corpus's `MCIHostStatus<T>` shape.
pub type Result<T = ()> = core::result::Result<T, Error>;
