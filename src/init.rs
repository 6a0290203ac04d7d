//! Card Identification & Initialization State Machine.
//!
//! Drives a freshly attached card from power-up through `IDLE → READY →
//! IDENT → STANDBY → TRANSFER`. Grounded on `card_init_proc`/
//! `bus_voltage_prob` in `mci_host/sd/mod.rs`'s Phytium-specific
//! implementation, generalized to the two card kinds in scope (SD,
//! eMMC) and with the UHS 1.8V voltage-switch branch dropped (Non-goal).

use core::time::Duration;

use crate::card::{CapacityClass, Card, CardKind, Partition, TimingMode};
use crate::command;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::host_adapter::{ClockMode, HostAdapter, HostCapability};
use crate::registers::{Csd, ExtCsdPartitions, Scr};

const OCR_BUSY: u32 = 1 << 31;
const OCR_CCS: u32 = 1 << 30;
/// 3.2-3.3V and 3.3-3.4V windows, the pair `CMD1`/`ACMD41` offer for a
/// "give me your native voltage" probe.
const OCR_VOLTAGE_3_3_3_4: u32 = (1 << 20) | (1 << 21);
/// 2.7-3.6V, the full SD voltage window `ACMD41` advertises.
const OCR_VOLTAGE_WINDOW_SD: u32 = 0x00FF_8000;

const CMD8_VOLTAGE_AND_PATTERN: u32 = 0x1AA;

/// `EXT_CSD_BUS_WIDTH` index, written via `CMD6` during wide-bus setup.
const EXT_CSD_BUS_WIDTH: u8 = 183;
/// `EXT_CSD_HS_TIMING` index, written via `CMD6` to enable high speed.
const EXT_CSD_HS_TIMING: u8 = 185;
/// `EXT_CSD_PART_CONFIG` index, written via `CMD6` by the transfer engine
/// to switch the active partition.
pub(crate) const EXT_CSD_PART_CONFIG: u8 = 179;

/// Identify whatever card is in the slot. Leaves the descriptor unknown
/// (empty) and returns `IoError` if nothing responds within the
/// identification loop's ~1s bound.
pub fn identify<H: HostAdapter>(card: &mut Card<H>, config: &Config) -> Result<()> {
    card.host.set_clock(ClockMode::IdMode);

    // eMMC pre-idle: a real card ignores this if it isn't one; errors here
    // are expected and discarded.
    let _ = card.host.send_cmd(0, 0xF0F0_F0F0);
    crate::mci_sleep(Duration::from_millis(100));
    power_up_delay();
    card.host.send_cmd(0, 0)?;

    let mut cmd1_real_success = false;
    let mut mmc_ocr = 0u32;
    let mut mmc_ready = false;

    if config.mmc_support {
        if let Ok(ocr) = try_cmd1(&card.host, OCR_VOLTAGE_3_3_3_4) {
            cmd1_real_success = true;
            mmc_ocr = ocr;
            mmc_ready = ocr & OCR_BUSY != 0;
        }
    }

    let mut sd_hcs = false;
    let mut sd_ocr = 0u32;

    if !mmc_ready {
        match try_cmd8(&card.host) {
            Ok(echo) if echo & 0xFFF == CMD8_VOLTAGE_AND_PATTERN => sd_hcs = true,
            Ok(_) => return Err(Error::IoError),
            Err(_) => {}
        }

        let mut identified = false;
        for _ in 0..1000 {
            if cmd1_real_success {
                if let Ok(ocr) = try_cmd1(&card.host, OCR_VOLTAGE_3_3_3_4) {
                    mmc_ocr = ocr;
                    if ocr & OCR_BUSY != 0 {
                        mmc_ready = true;
                        identified = true;
                        break;
                    }
                }
            } else {
                let hcs_bit = if sd_hcs { OCR_CCS } else { 0 };
                if let Ok(ocr) = try_acmd41(&card.host, OCR_VOLTAGE_WINDOW_SD | hcs_bit) {
                    sd_ocr = ocr;
                    if ocr & OCR_BUSY != 0 {
                        identified = true;
                        break;
                    }
                }
            }
            crate::mci_sleep(Duration::from_millis(1));
        }
        if !identified {
            card.set_kind(CardKind::Unknown);
            return Err(Error::IoError);
        }
    }

    // Tie-break: eMMC only if CMD1 genuinely succeeded, not merely attempted.
    if mmc_ready && cmd1_real_success {
        card.set_kind(CardKind::Mmc);
        card.set_capacity_class(if mmc_ocr & OCR_CCS != 0 {
            CapacityClass::Block
        } else {
            CapacityClass::Byte
        });
    } else {
        card.set_kind(if sd_hcs {
            CardKind::SdV2
        } else {
            CardKind::SdV1
        });
        card.set_capacity_class(if sd_ocr & OCR_CCS != 0 {
            CapacityClass::Block
        } else {
            CapacityClass::Byte
        });
    }

    Ok(())
}

/// Bring an identified card from `IDENT` through `TRANSFER`, dispatching
/// to the SD or eMMC path by card kind.
pub fn initialize<H: HostAdapter>(card: &mut Card<H>, config: &Config) -> Result<()> {
    match card.kind() {
        CardKind::SdV1 | CardKind::SdV2 => initialize_sd(card, config),
        CardKind::Mmc => initialize_mmc(card, config),
        CardKind::Unknown => Err(Error::NoDevice),
    }
}

fn initialize_sd<H: HostAdapter>(card: &mut Card<H>, config: &Config) -> Result<()> {
    command::send(&card.host, 2, 0)?;
    let _cid = command::recv_r2(&card.host, 2)?;

    command::send(&card.host, 3, 0)?;
    let rca = command::recv_r6(&card.host, 3)?;
    card.set_rca(rca);

    let status = command::get_status(&card.host, rca)?;
    command::verify_state(status.state, command::CardState::Stby)?;

    decode_and_store_sd_csd(card)?;

    if card.dsr_implemented() {
        card.host.send_cmd(4, (config.dsr as u32) << 16)?;
    }

    command::send(&card.host, 7, (rca as u32) << 16)?;
    command::recv_r1(&card.host, 7)?;

    let caps = card.host_capabilities();
    if caps.contains(HostCapability::BIT4_ONLY) {
        card.host.set_widebus(true);
        card.set_wide_bus(true);
    }

    let scr_bytes = read_scr(card)?;
    let scr = Scr::decode(&scr_bytes);
    card.set_cmd23_support(scr.cmd23_support);

    if caps.contains(HostCapability::BIT4_CAPABLE) && scr.supports_4bit() {
        wide_bus_sd(card, config)?;
    }

    Ok(())
}

fn decode_and_store_sd_csd<H: HostAdapter>(card: &mut Card<H>) -> Result<()> {
    command::send(&card.host, 9, (card.rca() as u32) << 16)?;
    let csd_words = command::recv_r2(&card.host, 9)?;
    let csd = if card.capacity_class() == CapacityClass::Block {
        Csd::decode_sd_block_addressed(&csd_words)
    } else {
        Csd::decode_sd_byte_addressed(&csd_words)
    };
    store_csd(card, &csd)
}

fn store_csd<H: HostAdapter>(card: &mut Card<H>, csd: &Csd) -> Result<()> {
    card.set_block_geometry(csd.block_size, csd.block_shift);
    card.set_dsr_implemented(csd.dsr_implemented);
    card.set_write_protected(csd.write_protected);
    if let Some(block_count) = csd.block_count {
        card.set_partition(Partition::User, block_count);
    }
    Ok(())
}

fn read_scr<H: HostAdapter>(card: &Card<H>) -> Result<[u8; 8]> {
    command::send(&card.host, 55, (card.rca() as u32) << 16)?;
    command::recv_r1(&card.host, 55)?;

    card.host.block_setup(8, 1)?;
    let mut buf = [0u8; 8];
    card.host.recv_setup(&mut buf)?;
    card.host.wait_enable(
        crate::host_adapter::HostEvent::TRANSFER_DONE | crate::host_adapter::HostEvent::ERROR,
        100,
    );
    command::send(&card.host, 51, 0)?;
    command::recv_r1(&card.host, 51)?;
    let event = card.host.event_wait();
    if !event.contains(crate::host_adapter::HostEvent::TRANSFER_DONE) {
        card.host.cancel();
        return Err(Error::IoError);
    }
    Ok(buf)
}

fn wide_bus_sd<H: HostAdapter>(card: &mut Card<H>, _config: &Config) -> Result<()> {
    let rca = card.rca();

    // ACMD42 (disconnect CD/DAT3 pull-up) is an optimization, not required
    // for correct operation; tolerate failure.
    if command::send(&card.host, 55, (rca as u32) << 16).is_ok() {
        let _ = command::recv_r1(&card.host, 55);
        if command::send(&card.host, 42, 0).is_ok() {
            let _ = command::recv_r1(&card.host, 42);
        } else {
            log::warn!("ACMD42 pull-up disconnect failed, continuing");
        }
    }

    command::send(&card.host, 55, (rca as u32) << 16)?;
    command::recv_r1(&card.host, 55)?;
    command::send(&card.host, 6, 2)?;
    command::recv_r1(&card.host, 6)?;

    card.host.set_widebus(true);
    card.set_wide_bus(true);
    card.host.set_clock(ClockMode::Sd4BitTransfer);
    crate::mci_sleep(Duration::from_millis(5));
    Ok(())
}

fn initialize_mmc<H: HostAdapter>(card: &mut Card<H>, config: &Config) -> Result<()> {
    command::send(&card.host, 2, 0)?;
    let _cid = command::recv_r2(&card.host, 2)?;

    const MMC_RCA: u16 = 1;
    card.host.send_cmd(3, (MMC_RCA as u32) << 16)?;
    card.set_rca(MMC_RCA);

    let status = command::get_status(&card.host, MMC_RCA)?;
    command::verify_state(status.state, command::CardState::Stby)?;

    decode_and_store_mmc_csd(card)?;

    if card.dsr_implemented() {
        card.host.send_cmd(4, (config.dsr as u32) << 16)?;
    }

    command::send(&card.host, 7, (MMC_RCA as u32) << 16)?;
    command::recv_r1(&card.host, 7)?;

    let caps = card.host_capabilities();
    if caps.contains(HostCapability::BIT4_ONLY) {
        card.host.set_widebus(true);
        card.set_wide_bus(true);
    }

    if card.capacity_class() == CapacityClass::Block {
        let extcsd = read_ext_csd(card)?;
        card.host.got_extcsd(&extcsd);
        let partitions = crate::registers::ext_csd::decode(&extcsd);
        store_ext_csd_partitions(card, &partitions);
        // SEC_COUNT may supersede a CSD block count that deferred above
        // the C_SIZE threshold.
        decode_and_store_mmc_csd(card)?;
        if card.partition(Partition::User).block_count == 0 {
            card.set_partition(Partition::User, partitions.user);
        }
    }

    wide_bus_mmc(card, config)?;

    Ok(())
}

fn decode_and_store_mmc_csd<H: HostAdapter>(card: &mut Card<H>) -> Result<()> {
    command::send(&card.host, 9, (card.rca() as u32) << 16)?;
    let csd_words = command::recv_r2(&card.host, 9)?;
    let csd = Csd::decode_mmc(&csd_words);
    store_csd(card, &csd)
}

fn store_ext_csd_partitions<H: HostAdapter>(card: &mut Card<H>, partitions: &ExtCsdPartitions) {
    if partitions.user > 0 {
        card.set_partition(Partition::User, partitions.user);
    }
    card.set_partition(Partition::Boot0, partitions.boot0);
    card.set_partition(Partition::Boot1, partitions.boot1);
    card.set_partition(Partition::Rpmb, partitions.rpmb);
    card.set_partition(Partition::Gp1, partitions.gp[0]);
    card.set_partition(Partition::Gp2, partitions.gp[1]);
    card.set_partition(Partition::Gp3, partitions.gp[2]);
    card.set_partition(Partition::Gp4, partitions.gp[3]);
}

fn read_ext_csd<H: HostAdapter>(card: &Card<H>) -> Result<[u8; 512]> {
    card.host.block_setup(512, 1)?;
    let mut buf = [0u8; 512];
    card.host.recv_setup(&mut buf)?;
    card.host.wait_enable(
        crate::host_adapter::HostEvent::TRANSFER_DONE | crate::host_adapter::HostEvent::ERROR,
        100,
    );
    command::send(&card.host, 8, 0)?;
    command::recv_r1(&card.host, 8)?;
    let event = card.host.event_wait();
    if !event.contains(crate::host_adapter::HostEvent::TRANSFER_DONE) {
        card.host.cancel();
        return Err(Error::IoError);
    }
    Ok(buf)
}

/// Write one EXT_CSD byte via `CMD6` in the access-write-byte mode and
/// block until the card leaves the resulting programming state.
pub(crate) fn mmc_switch<H: HostAdapter>(
    card: &mut Card<H>,
    config: &Config,
    index: u8,
    value: u8,
) -> Result<()> {
    const ACCESS_WRITE_BYTE: u32 = 3;
    let arg = (ACCESS_WRITE_BYTE << 24) | ((index as u32) << 16) | ((value as u32) << 8);
    command::switch(&card.host, card.rca(), arg, config.check_ready_without_sleep)?;
    card.set_write_busy(true);
    Ok(())
}

fn wide_bus_mmc<H: HostAdapter>(card: &mut Card<H>, config: &Config) -> Result<()> {
    let caps = card.host_capabilities();
    if !caps.contains(HostCapability::BIT1_ONLY) {
        mmc_switch(card, config, EXT_CSD_BUS_WIDTH, 1)?;
        card.host.set_widebus(true);
        card.set_wide_bus(true);
    }

    if caps.contains(HostCapability::MMC_HIGH_SPEED) {
        mmc_switch(card, config, EXT_CSD_HS_TIMING, 1)?;
        card.set_timing_mode(TimingMode::HighSpeed);
    }

    card.host.set_clock(ClockMode::MmcTransfer);
    crate::mci_sleep(Duration::from_millis(5));
    Ok(())
}

fn try_cmd1<H: HostAdapter>(host: &H, voltage: u32) -> Result<u32> {
    command::send(host, 1, voltage)?;
    command::recv_r3(host, 1)
}

fn try_cmd8<H: HostAdapter>(host: &H) -> Result<u32> {
    command::send(host, 8, CMD8_VOLTAGE_AND_PATTERN)?;
    command::recv_r7(host, 8)
}

fn try_acmd41<H: HostAdapter>(host: &H, arg: u32) -> Result<u32> {
    command::send(host, 55, 0)?;
    command::recv_r1(host, 55)?;
    command::send(host, 41, arg)?;
    command::recv_r3(host, 41)
}

/// 74 clock cycles at 400kHz, ~250us. Approximated as a fixed busy-wait
/// spin since the core has no cycle counter of its own.
fn power_up_delay() {
    for _ in 0..2500 {
        core::hint::spin_loop();
    }
}
