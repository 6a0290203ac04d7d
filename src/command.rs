//! Command/Response Layer: issues commands and interprets R1/R2/R3/R6/R7,
//! extracting status bits and card addresses.
//!
//! Grounded on the corpus's command-issuing helpers in `mci_host/sd/mod.rs`
//! (the `CMD13`-polling busy loop, the R1-error-mask check before trusting
//! a response) generalized away from the Phytium-specific plumbing those
//! helpers are tangled with.

use core::time::Duration;

use crate::error::{Error, Result};
use crate::host_adapter::HostAdapter;

/// Bits `r1 & ERROR_MASK != 0` indicate a command-level failure. Matches
/// the corpus's `MCIHostCardStatusFlag::ALL_ERROR_FLAG`.
const ERROR_MASK: u32 = 0xFFF9_0008;

/// `CARD_IS_LOCKED`, bit 25 of the R1/R6 status word.
const CARD_IS_LOCKED: u32 = 1 << 25;

/// Card state as carried in R1 bits `[12:9]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Idle,
    Ready,
    Ident,
    Stby,
    Tran,
    Data,
    Rcv,
    Prg,
    Dis,
    /// A state value the protocol does not define; treated as a hard
    /// failure everywhere a specific state is expected.
    Unknown(u32),
}

impl CardState {
    fn from_r1(r1: u32) -> Self {
        match (r1 >> 9) & 0x0F {
            0 => CardState::Idle,
            1 => CardState::Ready,
            2 => CardState::Ident,
            3 => CardState::Stby,
            4 => CardState::Tran,
            5 => CardState::Data,
            6 => CardState::Rcv,
            7 => CardState::Prg,
            8 => CardState::Dis,
            other => CardState::Unknown(other),
        }
    }
}

/// A decoded R1 (normal status) response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct R1Status {
    pub state: CardState,
    pub locked: bool,
}

fn decode_r1(r1: u32) -> Result<R1Status> {
    if r1 & ERROR_MASK != 0 {
        return Err(Error::IoError);
    }
    Ok(R1Status {
        state: CardState::from_r1(r1),
        locked: r1 & CARD_IS_LOCKED != 0,
    })
}

/// Fire a command and wait for its response to be ready. Does not itself
/// fetch the response: pair with one of `recv_r1`..`recv_r7`.
pub fn send<H: HostAdapter>(host: &H, opcode: u32, arg: u32) -> Result<()> {
    host.send_cmd(opcode, arg)?;
    host.wait_response(opcode)
}

/// Fetch and decode an R1 response.
///
/// A set `CardLocked` bit is reported on the decoded status rather than
/// acted on here: the caller (holding the card descriptor) is responsible
/// for latching it, so a later write can fail `Locked` before touching the
/// bus.
pub fn recv_r1<H: HostAdapter>(host: &H, opcode: u32) -> Result<R1Status> {
    let r1 = host.recv_r1(opcode)?;
    decode_r1(r1)
}

/// Fetch a raw R2 (CID/CSD) response, word 0 = bits 127:96.
pub fn recv_r2<H: HostAdapter>(host: &H, opcode: u32) -> Result<[u32; 4]> {
    host.recv_r2(opcode)
}

/// Fetch a raw R3 (OCR) response.
pub fn recv_r3<H: HostAdapter>(host: &H, opcode: u32) -> Result<u32> {
    host.recv_r3(opcode)
}

/// Fetch and decode an R6 (published RCA + status) response. Returns the
/// new RCA on success; the caller stores it on the descriptor.
pub fn recv_r6<H: HostAdapter>(host: &H, opcode: u32) -> Result<u16> {
    let r6 = host.recv_r6(opcode)?;
    if r6 & ERROR_MASK != 0 {
        return Err(Error::IoError);
    }
    Ok((r6 >> 16) as u16)
}

/// Fetch a raw R7 (interface condition echo) response.
pub fn recv_r7<H: HostAdapter>(host: &H, opcode: u32) -> Result<u32> {
    host.recv_r7(opcode)
}

/// `CMD13`: fetch the card's current status.
pub fn get_status<H: HostAdapter>(host: &H, rca: u16) -> Result<R1Status> {
    send(host, 13, (rca as u32) << 16)?;
    recv_r1(host, 13)
}

/// Fail `Invalid` unless `actual == expected`.
pub fn verify_state(actual: CardState, expected: CardState) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Invalid)
    }
}

/// `CMD12`: stop an in-progress multi-block transfer.
pub fn stop_transmission<H: HostAdapter>(host: &H) -> Result<R1Status> {
    send(host, 12, 0)?;
    recv_r1(host, 12)
}

/// Poll `CMD13` until the card reports `Tran`, tolerating `Prg`/`Rcv` as
/// still-busy. Bounded to roughly one second of wall-clock time; any other
/// state fails `Invalid` immediately, and exhausting the bound fails
/// `Timeout`.
pub fn transfer_ready<H: HostAdapter>(host: &H, rca: u16, yield_only: bool) -> Result<()> {
    const POLL_BUDGET: u32 = 1000;

    for _ in 0..POLL_BUDGET {
        let status = get_status(host, rca)?;
        match status.state {
            CardState::Tran => return Ok(()),
            CardState::Prg | CardState::Rcv => {
                if yield_only {
                    core::hint::spin_loop();
                } else {
                    crate::mci_sleep(Duration::from_millis(1));
                }
            }
            other => {
                let _ = other;
                return Err(Error::Invalid);
            }
        }
    }

    Err(Error::Timeout)
}

/// `CMD6`: switch a card setting after first ensuring it is not mid-program.
/// Returns the resulting status; the caller is responsible for marking
/// write-busy true on success, since CMD6 always ends in `Prg`.
pub fn switch<H: HostAdapter>(
    host: &H,
    rca: u16,
    arg: u32,
    yield_only: bool,
) -> Result<R1Status> {
    transfer_ready(host, rca, yield_only)?;
    send(host, 6, arg)?;
    recv_r1(host, 6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_r1_reports_error() {
        assert_eq!(decode_r1(ERROR_MASK), Err(Error::IoError));
    }

    #[test]
    fn decode_r1_reports_locked() {
        let r1 = CARD_IS_LOCKED | (4 << 9); // TRAN state, locked
        let status = decode_r1(r1).unwrap();
        assert!(status.locked);
        assert_eq!(status.state, CardState::Tran);
    }

    #[test]
    fn verify_state_matches() {
        assert!(verify_state(CardState::Stby, CardState::Stby).is_ok());
        assert_eq!(
            verify_state(CardState::Stby, CardState::Tran),
            Err(Error::Invalid)
        );
    }
}
