//! Host Adapter Interface (HAI) — the contract this crate requires from a
//! concrete SDIO host controller driver.
//!
//! Grounded on the corpus's `MCIHostDevice` trait (`&self` methods, plain
//! return types, doc comment on every method) but narrowed to the
//! operations the generic core actually needs: the corpus's trait also
//! carries UHS tuning, DDR/HS400 enable, and SDIO-interrupt hooks that are
//! this crate's Non-goals. The core never inspects a `HostAdapter`
//! implementation's internals; it only calls through this trait.

use bitflags::bitflags;

use crate::error::Result;

/// Host clock modes the core selects during identification, init, and
/// wide-bus selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Identification-mode clock, at or below 400 kHz.
    IdMode,
    /// Clock disabled (bus torn down on eject).
    Disabled,
    /// SD transfer clock, 1-bit bus.
    Sd1BitTransfer,
    /// SD transfer clock, 4-bit bus.
    Sd4BitTransfer,
    /// eMMC transfer clock (post high-speed switch when applicable).
    MmcTransfer,
}

bitflags! {
    /// Completion events a host wait can report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostEvent: u32 {
        /// The armed command/data transfer finished without error.
        const TRANSFER_DONE = 1 << 0;
        /// The armed wait's deadline elapsed.
        const TIMEOUT = 1 << 1;
        /// The host signaled a transfer error (CRC, end-bit, etc).
        const ERROR = 1 << 2;
        /// The host's write-complete (busy-release) event fired.
        const WRCOMPLETE = 1 << 3;
    }
}

bitflags! {
    /// Media-change callback arm/disarm mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallbackMask: u32 {
        /// Notify on card insertion.
        const INSERTED = 1 << 0;
        /// Notify on card ejection.
        const EJECTED = 1 << 1;
    }
}

bitflags! {
    /// Host capability bits consulted by the transfer engine and the wide-bus
    /// step of initialization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostCapability: u32 {
        /// Host can set up DMA receive/send buffers.
        const DMA = 1 << 0;
        /// DMA must be armed before the command that starts the transfer
        /// (rather than after), e.g. some hosts require `dma_*_setup`
        /// ahead of `send_cmd` for CMD24/CMD25.
        const DMA_BEFORE_CMD = 1 << 1;
        /// Host only supports a 4-bit data bus (never 1-bit).
        const BIT4_ONLY = 1 << 2;
        /// Host only supports a 1-bit data bus.
        const BIT1_ONLY = 1 << 3;
        /// Host can drive a 4-bit data bus (in addition to 1-bit).
        const BIT4_CAPABLE = 1 << 4;
        /// Host can clock an eMMC high-speed transfer rate.
        const MMC_HIGH_SPEED = 1 << 5;
        /// The physical bus is shared with other peripherals and the
        /// adapter requires a second, host-scoped lock around transfers.
        const SHARED_BUS = 1 << 6;
    }
}

/// Media-change notification delivered to the callback registered via
/// [`HostAdapter::register_callback`]. May arrive on a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEvent {
    /// A card was inserted.
    Inserted,
    /// The card was removed.
    Ejected,
}

/// The external contract the driver requires from an SDIO host controller.
///
/// Implementations own the physical register/DMA/interrupt plumbing; this
/// trait is the entire surface the card/command/transfer logic is allowed
/// to call through. Every method takes `&self`: concrete adapters are
/// expected to use interior mutability for hardware state, the same way
/// the corpus's device trait does.
pub trait HostAdapter {
    /// Send a command with the given argument. Does not wait for the
    /// response to be ready; pair with [`HostAdapter::wait_response`].
    fn send_cmd(&self, opcode: u32, arg: u32) -> Result<()>;

    /// Block until the command issued by the most recent `send_cmd` has a
    /// response ready (or fails/times out at the host level).
    fn wait_response(&self, opcode: u32) -> Result<()>;

    /// Fetch an R1 (normal status) response for the given opcode.
    fn recv_r1(&self, opcode: u32) -> Result<u32>;
    /// Fetch an R2 (CID/CSD, 128-bit) response, word 0 = bits 127:96.
    fn recv_r2(&self, opcode: u32) -> Result<[u32; 4]>;
    /// Fetch an R3 (OCR) response.
    fn recv_r3(&self, opcode: u32) -> Result<u32>;
    /// Fetch an R6 (published RCA + card status) response.
    fn recv_r6(&self, opcode: u32) -> Result<u32>;
    /// Fetch an R7 (voltage echo + check pattern) response.
    fn recv_r7(&self, opcode: u32) -> Result<u32>;

    /// Configure the host for a transfer of `n_blocks` blocks of
    /// `block_size` bytes each.
    fn block_setup(&self, block_size: u32, n_blocks: u32) -> Result<()>;
    /// Arm a PIO receive into `buf`.
    fn recv_setup(&self, buf: &mut [u8]) -> Result<()>;
    /// Arm a PIO send from `buf`.
    fn send_setup(&self, buf: &[u8]) -> Result<()>;
    /// Arm a DMA receive into `buf`. Only called when
    /// [`HostCapability::DMA`] is set.
    fn dma_recv_setup(&self, buf: &mut [u8]) -> Result<()>;
    /// Arm a DMA send from `buf`. Only called when [`HostCapability::DMA`]
    /// is set.
    fn dma_send_setup(&self, buf: &[u8]) -> Result<()>;
    /// Report whether `buf` meets the host's DMA alignment/region
    /// constraints. `false` means the transfer engine must bounce through
    /// an aligned buffer.
    fn dma_preflight(&self, buf: &[u8]) -> bool;

    /// Arm a completion wait for the events in `mask`, with the given
    /// deadline in milliseconds.
    fn wait_enable(&self, mask: HostEvent, deadline_ms: u32);
    /// Block until an armed wait resolves, returning the event(s) that
    /// fired.
    fn event_wait(&self) -> HostEvent;
    /// Tear down any outstanding armed transfer. Called by the core on
    /// every failure path that armed a wait, before returning the error.
    fn cancel(&self);

    /// Select the host clock mode.
    fn set_clock(&self, mode: ClockMode);
    /// Tell the host to switch its data bus to 4-bit (`true`) or 1-bit
    /// (`false`).
    fn set_widebus(&self, wide: bool);

    /// Report whether a card is currently physically present.
    fn present(&self) -> bool;
    /// Report the host-side mechanical write-protect switch.
    fn wrprotected(&self) -> bool;

    /// Register the media-change callback.
    fn register_callback(&self, cb: fn(MediaEvent));
    /// Enable or disable delivery for the given callback mask.
    fn callback_enable(&self, mask: CallbackMask);

    /// Report the host's capability bitset.
    fn capabilities(&self) -> HostCapability;

    /// Acquire the host-scoped bus lock. Only called when
    /// [`HostCapability::SHARED_BUS`] is set, after the caller already
    /// holds the card lock (a `&mut` borrow of the card, in this crate),
    /// per spec §5's "card lock, then bus lock" ordering. Default no-op
    /// for the common case of a card with an unshared bus.
    fn bus_lock(&self) {}
    /// Release the lock taken by [`HostAdapter::bus_lock`]. Always called
    /// before the card lock is released, even on an error return.
    fn bus_unlock(&self) {}

    /// Host-side hook invoked with the raw 512-byte EXT_CSD after a
    /// successful eMMC EXT_CSD read, for hosts that want to cache or log
    /// it. Default is a no-op; the core's own decode does not depend on
    /// this being implemented.
    fn got_extcsd(&self, _buf: &[u8; 512]) {}
}
