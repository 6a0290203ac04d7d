//! The Card Descriptor and Partition Descriptor: the per-slot state every
//! other component reads and mutates under the slot's lock.
//!
//! Shaped on the corpus's `MCICardBase`/`SdCard` combination (host handle +
//! flat scalar fields, no nested "context" struct), generalized to cover
//! both SD and eMMC instead of being SD-specific.

use core::fmt;

use crate::host_adapter::{HostAdapter, HostCapability};

/// What kind of card, if any, is identified in this slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    /// No card identified yet, or the card has been ejected.
    Unknown,
    /// SD version 1.x.
    SdV1,
    /// SD version 2.0 or later.
    SdV2,
    /// eMMC.
    Mmc,
}

/// Byte- vs block-addressed command argument convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityClass {
    Byte,
    Block,
}

/// Bus timing mode selected during wide-bus/high-speed setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingMode {
    /// Default SD/MMC signaling rate.
    BackwardCompat,
    /// SD/eMMC high-speed rate.
    HighSpeed,
    /// eMMC HS200 (Non-goal: tuning is never driven, but the mode is
    /// representable for a host that negotiates it out-of-band).
    Hs200,
    /// eMMC HS400 (see above).
    Hs400,
}

impl TimingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimingMode::BackwardCompat => "backward-compat",
            TimingMode::HighSpeed => "high-speed",
            TimingMode::Hs200 => "hs200",
            TimingMode::Hs400 => "hs400",
        }
    }
}

impl fmt::Display for TimingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the eight partitions a card may expose. Indices match the
/// `PARTITION_CONFIG` access values and the `/dev/mmcsd<minor><partname>`
/// naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    User,
    Boot0,
    Boot1,
    Rpmb,
    Gp1,
    Gp2,
    Gp3,
    Gp4,
}

impl Partition {
    /// All eight partitions, in descriptor array order.
    pub const ALL: [Partition; 8] = [
        Partition::User,
        Partition::Boot0,
        Partition::Boot1,
        Partition::Rpmb,
        Partition::Gp1,
        Partition::Gp2,
        Partition::Gp3,
        Partition::Gp4,
    ];

    /// The `PARTITION_CONFIG` access value / descriptor array index.
    pub fn index(&self) -> usize {
        match self {
            Partition::User => 0,
            Partition::Boot0 => 1,
            Partition::Boot1 => 2,
            Partition::Rpmb => 3,
            Partition::Gp1 => 4,
            Partition::Gp2 => 5,
            Partition::Gp3 => 6,
            Partition::Gp4 => 7,
        }
    }

    /// Device-name suffix, e.g. `"boot0"`; the user partition's suffix is
    /// empty so it registers as `/dev/mmcsd<minor>` itself.
    pub fn name(&self) -> &'static str {
        match self {
            Partition::User => "",
            Partition::Boot0 => "boot0",
            Partition::Boot1 => "boot1",
            Partition::Rpmb => "rpmb",
            Partition::Gp1 => "gp1",
            Partition::Gp2 => "gp2",
            Partition::Gp3 => "gp3",
            Partition::Gp4 => "gp4",
        }
    }

    /// Build from a `PARTITION_CONFIG`-style index (0..7).
    pub fn from_index(index: usize) -> Option<Self> {
        Partition::ALL.get(index).copied()
    }
}

/// Block count for one partition. A partition exists iff `block_count > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionDescriptor {
    pub block_count: u32,
}

impl PartitionDescriptor {
    pub fn exists(&self) -> bool {
        self.block_count > 0
    }
}

/// Maximum value the open-reference count saturates at.
pub const MAX_OPEN_REFS: u8 = 255;

/// Per-slot card state: identity, geometry, bus configuration, and the
/// host adapter handle. Mutated only while the slot's lock is held (see
/// [`crate::block_device::Slot`]).
pub struct Card<H: HostAdapter> {
    pub(crate) host: H,
    kind: CardKind,
    capacity_class: CapacityClass,
    rca: u16,
    block_size: u32,
    block_shift: u8,
    bus_width: u8,
    wide_bus: bool,
    timing_mode: TimingMode,
    host_capabilities: HostCapability,
    partitions: [PartitionDescriptor; 8],
    active_partition: Partition,
    write_protected: bool,
    locked: bool,
    write_busy: bool,
    block_length: u32,
    dsr_implemented: bool,
    cmd23_support: bool,
    media_changed: bool,
    open_count: u8,
    probed: bool,
}

impl<H: HostAdapter> Card<H> {
    /// Build an empty descriptor for a freshly attached host adapter. No
    /// card is assumed present; `identify()` must be run before any I/O.
    pub fn new(host: H) -> Self {
        let host_capabilities = host.capabilities();
        Card {
            host,
            kind: CardKind::Unknown,
            capacity_class: CapacityClass::Byte,
            rca: 0,
            block_size: 512,
            block_shift: 9,
            bus_width: 1,
            wide_bus: false,
            timing_mode: TimingMode::BackwardCompat,
            host_capabilities,
            partitions: [PartitionDescriptor::default(); 8],
            active_partition: Partition::User,
            write_protected: false,
            locked: false,
            write_busy: false,
            block_length: 0,
            dsr_implemented: false,
            cmd23_support: false,
            media_changed: false,
            open_count: 0,
            probed: false,
        }
    }

    /// `true` iff no card has ever been successfully identified (or the
    /// descriptor was reset on eject). All I/O against an empty
    /// descriptor fails `NoDevice`.
    pub fn is_empty(&self) -> bool {
        matches!(self.kind, CardKind::Unknown)
    }

    pub fn kind(&self) -> CardKind {
        self.kind
    }

    pub(crate) fn set_kind(&mut self, kind: CardKind) {
        self.kind = kind;
    }

    pub fn capacity_class(&self) -> CapacityClass {
        self.capacity_class
    }

    pub(crate) fn set_capacity_class(&mut self, class: CapacityClass) {
        self.capacity_class = class;
    }

    pub fn rca(&self) -> u16 {
        self.rca
    }

    pub(crate) fn set_rca(&mut self, rca: u16) {
        self.rca = rca;
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_shift(&self) -> u8 {
        self.block_shift
    }

    pub(crate) fn set_block_geometry(&mut self, block_size: u32, block_shift: u8) {
        self.block_size = block_size;
        self.block_shift = block_shift;
    }

    pub fn bus_width(&self) -> u8 {
        self.bus_width
    }

    pub fn wide_bus(&self) -> bool {
        self.wide_bus
    }

    pub(crate) fn set_wide_bus(&mut self, wide: bool) {
        self.wide_bus = wide;
        self.bus_width = if wide { 4 } else { 1 };
    }

    pub fn timing_mode(&self) -> TimingMode {
        self.timing_mode
    }

    pub(crate) fn set_timing_mode(&mut self, mode: TimingMode) {
        self.timing_mode = mode;
    }

    pub fn host_capabilities(&self) -> HostCapability {
        self.host_capabilities
    }

    pub fn partition(&self, partition: Partition) -> PartitionDescriptor {
        self.partitions[partition.index()]
    }

    pub(crate) fn set_partition(&mut self, partition: Partition, block_count: u32) {
        self.partitions[partition.index()] = PartitionDescriptor { block_count };
    }

    pub fn active_partition(&self) -> Partition {
        self.active_partition
    }

    pub(crate) fn set_active_partition(&mut self, partition: Partition) {
        self.active_partition = partition;
    }

    /// `true` iff the card may be written: not locked, and neither the
    /// card nor the host reports write-protection.
    pub fn writable(&self) -> bool {
        !self.locked && !self.write_protected && !self.host.wrprotected()
    }

    pub fn write_protected(&self) -> bool {
        self.write_protected
    }

    pub(crate) fn set_write_protected(&mut self, protected: bool) {
        self.write_protected = protected;
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub(crate) fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn write_busy(&self) -> bool {
        self.write_busy
    }

    pub(crate) fn set_write_busy(&mut self, busy: bool) {
        self.write_busy = busy;
    }

    /// Cached block length, i.e. the argument of the last successful
    /// `CMD16`. Zero means none has been issued yet.
    pub fn block_length(&self) -> u32 {
        self.block_length
    }

    pub(crate) fn set_block_length(&mut self, length: u32) {
        self.block_length = length;
    }

    pub fn dsr_implemented(&self) -> bool {
        self.dsr_implemented
    }

    pub(crate) fn set_dsr_implemented(&mut self, implemented: bool) {
        self.dsr_implemented = implemented;
    }

    pub fn cmd23_support(&self) -> bool {
        self.cmd23_support
    }

    pub(crate) fn set_cmd23_support(&mut self, support: bool) {
        self.cmd23_support = support;
    }

    /// Reads and clears the media-changed edge.
    pub fn take_media_changed(&mut self) -> bool {
        core::mem::take(&mut self.media_changed)
    }

    pub(crate) fn set_media_changed(&mut self) {
        self.media_changed = true;
    }

    pub fn probed(&self) -> bool {
        self.probed
    }

    pub(crate) fn set_probed(&mut self, probed: bool) {
        self.probed = probed;
    }

    pub fn open_count(&self) -> u8 {
        self.open_count
    }

    /// Increment the open-reference count, saturating at
    /// [`MAX_OPEN_REFS`]. Returns `Invalid` if already saturated.
    pub fn open(&mut self) -> crate::error::Result<()> {
        if self.open_count >= MAX_OPEN_REFS {
            return Err(crate::error::Error::Invalid);
        }
        self.open_count += 1;
        Ok(())
    }

    /// Decrement the open-reference count, saturating at zero.
    pub fn close(&mut self) {
        self.open_count = self.open_count.saturating_sub(1);
    }

    /// Reset identity, geometry, and partitions to the empty state,
    /// preserving the host adapter handle. Used on eject.
    pub(crate) fn reset_to_empty(&mut self) {
        self.kind = CardKind::Unknown;
        self.capacity_class = CapacityClass::Byte;
        self.rca = 0;
        self.block_size = 512;
        self.block_shift = 9;
        self.bus_width = 1;
        self.wide_bus = false;
        self.timing_mode = TimingMode::BackwardCompat;
        self.partitions = [PartitionDescriptor::default(); 8];
        self.active_partition = Partition::User;
        self.write_protected = false;
        self.locked = false;
        self.write_busy = false;
        self.block_length = 0;
        self.dsr_implemented = false;
        self.cmd23_support = false;
        self.media_changed = true;
        self.probed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::host_adapter::{CallbackMask, ClockMode, MediaEvent};

    struct NullHost;

    impl HostAdapter for NullHost {
        fn send_cmd(&self, _opcode: u32, _arg: u32) -> crate::error::Result<()> {
            Ok(())
        }
        fn wait_response(&self, _opcode: u32) -> crate::error::Result<()> {
            Ok(())
        }
        fn recv_r1(&self, _opcode: u32) -> crate::error::Result<u32> {
            Ok(0)
        }
        fn recv_r2(&self, _opcode: u32) -> crate::error::Result<[u32; 4]> {
            Ok([0; 4])
        }
        fn recv_r3(&self, _opcode: u32) -> crate::error::Result<u32> {
            Ok(0)
        }
        fn recv_r6(&self, _opcode: u32) -> crate::error::Result<u32> {
            Ok(0)
        }
        fn recv_r7(&self, _opcode: u32) -> crate::error::Result<u32> {
            Ok(0)
        }
        fn block_setup(&self, _block_size: u32, _n_blocks: u32) -> crate::error::Result<()> {
            Ok(())
        }
        fn recv_setup(&self, _buf: &mut [u8]) -> crate::error::Result<()> {
            Ok(())
        }
        fn send_setup(&self, _buf: &[u8]) -> crate::error::Result<()> {
            Ok(())
        }
        fn dma_recv_setup(&self, _buf: &mut [u8]) -> crate::error::Result<()> {
            Ok(())
        }
        fn dma_send_setup(&self, _buf: &[u8]) -> crate::error::Result<()> {
            Ok(())
        }
        fn dma_preflight(&self, _buf: &[u8]) -> bool {
            true
        }
        fn wait_enable(&self, _mask: crate::host_adapter::HostEvent, _deadline_ms: u32) {}
        fn event_wait(&self) -> crate::host_adapter::HostEvent {
            crate::host_adapter::HostEvent::TRANSFER_DONE
        }
        fn cancel(&self) {}
        fn set_clock(&self, _mode: ClockMode) {}
        fn set_widebus(&self, _wide: bool) {}
        fn present(&self) -> bool {
            true
        }
        fn wrprotected(&self) -> bool {
            false
        }
        fn register_callback(&self, _cb: fn(MediaEvent)) {}
        fn callback_enable(&self, _mask: CallbackMask) {}
        fn capabilities(&self) -> HostCapability {
            HostCapability::empty()
        }
    }

    #[test]
    fn fresh_descriptor_is_empty() {
        let card = Card::new(NullHost);
        assert!(card.is_empty());
        assert_eq!(card.block_size(), 512);
    }

    #[test]
    fn open_saturates_and_rejects_overflow() {
        let mut card = Card::new(NullHost);
        for _ in 0..MAX_OPEN_REFS {
            card.open().unwrap();
        }
        assert_eq!(card.open_count(), MAX_OPEN_REFS);
        assert_eq!(card.open(), Err(Error::Invalid));
    }

    #[test]
    fn close_never_underflows() {
        let mut card = Card::new(NullHost);
        card.close();
        assert_eq!(card.open_count(), 0);
    }

    #[test]
    fn writable_reflects_lock_and_protection_flags() {
        let mut card = Card::new(NullHost);
        assert!(card.writable());
        card.set_locked(true);
        assert!(!card.writable());
        card.set_locked(false);
        card.set_write_protected(true);
        assert!(!card.writable());
    }

    #[test]
    fn reset_to_empty_clears_partitions_and_sets_media_changed() {
        let mut card = Card::new(NullHost);
        card.set_kind(CardKind::SdV2);
        card.set_partition(Partition::User, 1000);
        card.reset_to_empty();
        assert!(card.is_empty());
        assert!(!card.partition(Partition::User).exists());
        assert!(card.take_media_changed());
    }
}
