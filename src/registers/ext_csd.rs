//! EXT_CSD (eMMC Extended CSD) decode — the 512-byte data block read via
//! CMD8 on eMMC cards.
//!
//! Field offsets and size formulas grounded on `mmcsd_decode_extcsd` in
//! `examples/original_source/drivers/mmcsd/mmcsd_sdio.c`; the header that
//! file includes for the `MMCSD_EXTCSD_*` byte offsets was not part of the
//! retrieved pack, so the offsets below are the standard JEDEC JESD84
//! EXT_CSD field positions the original's constants resolve to.

const SEC_COUNT: usize = 212; // 212..216, little-endian
const BOOT_SIZE_MULT: usize = 226;
const RPMB_SIZE_MULT: usize = 168;
const PARTITION_SUPPORT: usize = 160;
const PART_SUPPORT_PART_EN: u8 = 1 << 0;
const HC_WP_GRP_SIZE: usize = 221;
const HC_ERASE_GRP_SIZE: usize = 224;
const GP_SIZE_MULT: usize = 143; // 4 partitions x 3 bytes each
const PARTITION_SETTING_COMPLETED: usize = 155;

const SZ_128K: u32 = 128 * 1024;
const SZ_512K: u32 = 512 * 1024;
const SZ_512: u32 = 512;

/// Block counts for every partition EXT_CSD can describe, in the same
/// order as [`crate::card::Partition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtCsdPartitions {
    /// User data area, from `SEC_COUNT`.
    pub user: u32,
    /// Boot partition 0, from `BOOT_SIZE_MULT`.
    pub boot0: u32,
    /// Boot partition 1 (same size as boot0: one multiplier covers both).
    pub boot1: u32,
    /// Replay-protected memory block partition, from `RPMB_SIZE_MULT`.
    pub rpmb: u32,
    /// General-purpose partitions 1-4.
    pub gp: [u32; 4],
}

/// Decode the partition geometry out of a raw 512-byte EXT_CSD buffer.
pub fn decode(extcsd: &[u8; 512]) -> ExtCsdPartitions {
    let mut partitions = ExtCsdPartitions {
        user: u32::from_le_bytes([
            extcsd[SEC_COUNT],
            extcsd[SEC_COUNT + 1],
            extcsd[SEC_COUNT + 2],
            extcsd[SEC_COUNT + 3],
        ]),
        ..Default::default()
    };

    if extcsd[PARTITION_SUPPORT] & PART_SUPPORT_PART_EN == 0 {
        return partitions;
    }

    let boot_size = extcsd[BOOT_SIZE_MULT] as u32 * SZ_128K / SZ_512;
    partitions.boot0 = boot_size;
    partitions.boot1 = boot_size;
    partitions.rpmb = extcsd[RPMB_SIZE_MULT] as u32 * SZ_128K / SZ_512;

    let hc_erase_grp_sz = extcsd[HC_ERASE_GRP_SIZE] as u32;
    let hc_wp_grp_sz = extcsd[HC_WP_GRP_SIZE] as u32;

    for idx in 0..4 {
        let base = GP_SIZE_MULT + idx * 3;
        if extcsd[base] == 0 && extcsd[base + 1] == 0 && extcsd[base + 2] == 0 {
            continue;
        }
        if extcsd[PARTITION_SETTING_COMPLETED] == 0 {
            break;
        }
        let mult = (extcsd[base + 2] as u32) << 16
            | (extcsd[base + 1] as u32) << 8
            | extcsd[base] as u32;
        partitions.gp[idx] = mult * hc_erase_grp_sz * hc_wp_grp_sz * SZ_512K / SZ_512;
    }

    partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_partition_from_sec_count() {
        let mut buf = [0u8; 512];
        // 0x00E0_0000 sectors = 7 GiB, little-endian.
        buf[SEC_COUNT..SEC_COUNT + 4].copy_from_slice(&0x00E0_0000u32.to_le_bytes());
        let decoded = decode(&buf);
        assert_eq!(decoded.user, 0x00E0_0000);
        assert_eq!(decoded.boot0, 0);
        assert_eq!(decoded.gp, [0; 4]);
    }

    #[test]
    fn boot_and_rpmb_sized_when_partition_enabled() {
        let mut buf = [0u8; 512];
        buf[PARTITION_SUPPORT] = PART_SUPPORT_PART_EN;
        buf[BOOT_SIZE_MULT] = 4; // 4 * 128KiB = 512KiB = 1024 blocks
        buf[RPMB_SIZE_MULT] = 2; // 2 * 128KiB = 256KiB = 512 blocks
        let decoded = decode(&buf);
        assert_eq!(decoded.boot0, 4 * SZ_128K / SZ_512);
        assert_eq!(decoded.boot1, decoded.boot0);
        assert_eq!(decoded.rpmb, 2 * SZ_128K / SZ_512);
    }

    #[test]
    fn gp_partition_absent_when_multiplier_all_zero() {
        let mut buf = [0u8; 512];
        buf[PARTITION_SUPPORT] = PART_SUPPORT_PART_EN;
        buf[PARTITION_SETTING_COMPLETED] = 1;
        let decoded = decode(&buf);
        assert_eq!(decoded.gp, [0; 4]);
    }

    #[test]
    fn gp_partition_ignored_without_setting_completed() {
        let mut buf = [0u8; 512];
        buf[PARTITION_SUPPORT] = PART_SUPPORT_PART_EN;
        buf[GP_SIZE_MULT] = 1;
        buf[HC_ERASE_GRP_SIZE] = 1;
        buf[HC_WP_GRP_SIZE] = 1;
        // PARTITION_SETTING_COMPLETED left at 0
        let decoded = decode(&buf);
        assert_eq!(decoded.gp, [0; 4]);
    }

    #[test]
    fn gp_partition_sized_when_completed() {
        let mut buf = [0u8; 512];
        buf[PARTITION_SUPPORT] = PART_SUPPORT_PART_EN;
        buf[PARTITION_SETTING_COMPLETED] = 1;
        buf[GP_SIZE_MULT] = 2; // mult = 2
        buf[HC_ERASE_GRP_SIZE] = 1;
        buf[HC_WP_GRP_SIZE] = 1;
        let decoded = decode(&buf);
        assert_eq!(decoded.gp[0], 2 * 1 * 1 * SZ_512K / SZ_512);
        assert_eq!(decoded.gp[1..], [0, 0, 0]);
    }
}
