//! Discovery of gear on the bus: the INITIALISE / RANDOMISE / COMPARE /
//! PROGRAM SHORT ADDRESS / WITHDRAW sequence.
//!
//! COMPARE is a wired-OR question: every initialised device whose random
//! address is at or below the search address answers YES at once. The
//! master only ever learns "silence", "one answer" or "garbled", so the
//! engine binary-searches the 24-bit space for the lowest competing
//! random address, claims it, withdraws it and starts over until a
//! full-range COMPARE stays silent.

use crate::common::address::{Address, Long, Short};
use crate::common::defs::{MASK, SEARCH_ADDR_MAX};
use crate::drivers::command_utils::send16;
use crate::drivers::dispatcher::FrameSender;
use crate::drivers::driver::DaliSendResult;
use crate::gear::cmd_defs as cmd;
use crate::utils::long_address::set_search_addr_changed;
use log::{debug, warn};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Devices need a moment after RANDOMISE before comparisons are valid.
const RANDOMISE_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Copy, Clone)]
pub struct ScanOptions {
    /// Wipe all short addresses and readdress every device on the bus,
    /// instead of only searching for unaddressed ones.
    pub full: bool,
}

/// Cancellation token for a running scan. Cancelling never leaves the
/// bus in initialisation mode; TERMINATE is sent before the scan call
/// returns.
#[derive(Clone, Default)]
pub struct ScanControl(Arc<AtomicBool>);

impl ScanControl {
    pub fn new() -> ScanControl {
        ScanControl::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum ScanError {
    /// More devices than short addresses; the remainder stays
    /// unaddressed.
    AddressSpaceExhausted,
    Cancelled,
    Send(DaliSendResult),
}

impl Error for ScanError {}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::AddressSpaceExhausted => write!(f, "All 64 short addresses are in use"),
            ScanError::Cancelled => write!(f, "Scan cancelled"),
            ScanError::Send(e) => e.fmt(f),
        }
    }
}

impl From<DaliSendResult> for ScanError {
    fn from(res: DaliSendResult) -> ScanError {
        ScanError::Send(res)
    }
}

/// A device claimed during the search.
#[derive(Debug, Copy, Clone)]
pub struct Assignment {
    pub short: Short,
    pub random: Long,
}

enum CompareResult {
    /// Silence: no device at or below the search address.
    No,
    /// A clean YES.
    Single,
    /// Garbled answer: more than one device replied.
    Multiple,
}

async fn compare(sender: &dyn FrameSender) -> Result<CompareResult, ScanError> {
    match send16::query(sender, cmd::COMPARE()).await {
        DaliSendResult::Answer(_) => Ok(CompareResult::Single),
        DaliSendResult::Timeout => Ok(CompareResult::No),
        DaliSendResult::Framing => Ok(CompareResult::Multiple),
        e => Err(ScanError::Send(e)),
    }
}

/// Find out which short addresses answer on the bus. Runs as ordinary
/// query traffic; no initialisation state is touched.
pub async fn probe_short_addresses(sender: &dyn FrameSender) -> Result<u64, ScanError> {
    let mut occupied = 0u64;
    for addr in Short::all() {
        match send16::query(sender, cmd::QUERY_CONTROL_GEAR_PRESENT(addr)).await {
            DaliSendResult::Answer(_) => occupied |= 1 << addr.value(),
            DaliSendResult::Timeout => {}
            DaliSendResult::Framing => {
                warn!("{}: garbled answer, address used more than once", addr);
                occupied |= 1 << addr.value();
            }
            e => return Err(ScanError::Send(e)),
        }
    }
    Ok(occupied)
}

/// Search for devices in scope and give each one a short address.
///
/// `reserved` is a bitmask of short addresses that must not be handed
/// out (occupied on the bus, or recorded for a known device that is
/// temporarily missing). Ignored for a full scan, which wipes every
/// address first.
///
/// Requires the bus lock; pass a [`crate::drivers::dispatcher::ScanGuard`]
/// as sender so ordinary traffic cannot corrupt the search.
pub async fn assign_short_addresses(
    sender: &dyn FrameSender,
    options: ScanOptions,
    reserved: u64,
    control: &ScanControl,
) -> Result<Vec<Assignment>, ScanError> {
    // Clear any stale initialisation state before starting our own.
    send16::cmd(sender, cmd::TERMINATE()).await.check_send()?;
    let res = run_search(sender, options, reserved, control).await;
    // The bus must never be left in initialisation mode, also not on
    // errors or cancellation.
    let _ = send16::cmd(sender, cmd::TERMINATE()).await;
    res
}

async fn run_search(
    sender: &dyn FrameSender,
    options: ScanOptions,
    reserved: u64,
    control: &ScanControl,
) -> Result<Vec<Assignment>, ScanError> {
    let scope = if options.full {
        cmd::INITIALISE_ALL
    } else {
        cmd::INITIALISE_UNADDRESSED
    };
    send16::cmd(sender, cmd::INITIALISE(scope)).await.check_send()?;
    if options.full {
        send16::cmd(sender, cmd::DTR0(MASK)).await.check_send()?;
        send16::cmd(sender, cmd::SET_SHORT_ADDRESS(Address::Broadcast))
            .await
            .check_send()?;
    }
    send16::cmd(sender, cmd::RANDOMISE()).await.check_send()?;
    sleep(RANDOMISE_SETTLE).await;

    let reserved = if options.full { 0 } else { reserved };
    let mut free = (0u8..64)
        .filter(move |a| reserved & (1u64 << a) == 0)
        .map(Short::new);

    let mut found = Vec::new();
    let mut search_addr = None;
    loop {
        if control.cancelled() {
            return Err(ScanError::Cancelled);
        }
        // A compare over the full range answers whether anything is
        // still competing at all.
        set_search_addr_changed(sender, SEARCH_ADDR_MAX, &mut search_addr).await?;
        if let CompareResult::No = compare(sender).await? {
            break;
        }

        // Narrow down to the lowest competing random address. The upper
        // bound is inclusive and always contains at least one device.
        let mut low = 0u32;
        let mut high = SEARCH_ADDR_MAX;
        while low < high {
            if control.cancelled() {
                return Err(ScanError::Cancelled);
            }
            let mid = low + (high - low) / 2;
            set_search_addr_changed(sender, mid, &mut search_addr).await?;
            match compare(sender).await? {
                CompareResult::No => low = mid + 1,
                CompareResult::Single | CompareResult::Multiple => high = mid,
            }
        }

        set_search_addr_changed(sender, low, &mut search_addr).await?;
        match compare(sender).await? {
            CompareResult::No => {
                // The device vanished mid-search; start the round over.
                warn!("Device at 0x{:06x} disappeared during search", low);
                continue;
            }
            CompareResult::Multiple => {
                // Several devices rolled the same random address. Only
                // devices that are not withdrawn take part in the next
                // comparison, so a fresh RANDOMISE re-rolls exactly the
                // colliding rest of the field.
                warn!("Random address clash at 0x{:06x}, re-randomising", low);
                send16::cmd(sender, cmd::RANDOMISE()).await.check_send()?;
                sleep(RANDOMISE_SETTLE).await;
                continue;
            }
            CompareResult::Single => {}
        }

        let Some(short) = free.next() else {
            return Err(ScanError::AddressSpaceExhausted);
        };
        send16::cmd(sender, cmd::PROGRAM_SHORT_ADDRESS(short.command_byte()))
            .await
            .check_send()?;
        match send16::query(sender, cmd::QUERY_SHORT_ADDRESS())
            .await
            .check_answer()
        {
            Ok(got) if got == short.command_byte() => {
                send16::cmd(sender, cmd::WITHDRAW()).await.check_send()?;
                debug!("0x{:06x} -> {}", low, short);
                found.push(Assignment { short, random: low });
            }
            Ok(got) => {
                // The address did not stick. Withdraw the device anyway
                // so the search can make progress; the claimed short
                // address stays burned since we cannot tell what the
                // device ended up with.
                warn!(
                    "{}: address did not stick (device reports 0x{:02x})",
                    short, got
                );
                send16::cmd(sender, cmd::WITHDRAW()).await.check_send()?;
            }
            Err(e) if e.is_framing_error() => {
                warn!("Clashing answers at 0x{:06x}, re-randomising", low);
                send16::cmd(sender, cmd::RANDOMISE()).await.check_send()?;
                sleep(RANDOMISE_SETTLE).await;
            }
            Err(e) => return Err(ScanError::Send(e)),
        }
    }
    Ok(found)
}
