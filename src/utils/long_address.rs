//! Helpers for the 24-bit search address used during addressing.

use crate::common::address::{Long, Short};
use crate::drivers::command_utils::send16;
use crate::drivers::dispatcher::FrameSender;
use crate::drivers::driver::DaliSendResult;
use crate::gear::cmd_defs as cmd;

/// Program the search address registers, skipping bytes that already
/// hold the wanted value. During a binary search most updates only
/// touch one or two bytes, which roughly halves the bus traffic.
pub async fn set_search_addr_changed(
    sender: &dyn FrameSender,
    addr: Long,
    current: &mut Option<Long>,
) -> Result<(), DaliSendResult> {
    let diff = match *current {
        Some(current) => addr ^ current,
        None => 0xff_ffff,
    };
    if diff & 0xff_0000 != 0 {
        send16::cmd(sender, cmd::SEARCHADDRH((addr >> 16 & 0xff) as u8))
            .await
            .check_send()?;
    }
    if diff & 0x00_ff00 != 0 {
        send16::cmd(sender, cmd::SEARCHADDRM((addr >> 8 & 0xff) as u8))
            .await
            .check_send()?;
    }
    if diff & 0x00_00ff != 0 {
        send16::cmd(sender, cmd::SEARCHADDRL((addr & 0xff) as u8))
            .await
            .check_send()?;
    }
    *current = Some(addr);
    Ok(())
}

/// Program all three search address registers.
pub async fn set_search_addr(sender: &dyn FrameSender, addr: Long) -> Result<(), DaliSendResult> {
    set_search_addr_changed(sender, addr, &mut None).await
}

/// Read back the random address of the device at `addr`.
pub async fn query_random_addr(
    sender: &dyn FrameSender,
    addr: Short,
) -> Result<Long, DaliSendResult> {
    let h = send16::query(sender, cmd::QUERY_RANDOM_ADDRESS_H(addr))
        .await
        .check_answer()?;
    let m = send16::query(sender, cmd::QUERY_RANDOM_ADDRESS_M(addr))
        .await
        .check_answer()?;
    let l = send16::query(sender, cmd::QUERY_RANDOM_ADDRESS_L(addr))
        .await
        .check_answer()?;
    Ok(((h as Long) << 16) | ((m as Long) << 8) | (l as Long))
}
