//! Glue between the typed command definitions and the dispatcher. The
//! reply and repeat metadata of a [`Command`] decides the transaction
//! flags; callers never pick them by hand.

use super::dispatcher::FrameSender;
use super::driver::{DaliFrame, DaliSendResult};
use super::send_flags::{EXPECT_ANSWER, NO_FLAG, SEND_TWICE};

pub mod send16 {
    use super::*;
    use crate::common::address::AddressByte;
    use crate::gear::cmd_defs::{Command, DAPC};

    /// Send a command that does not answer.
    pub async fn cmd<const T: bool>(
        sender: &dyn FrameSender,
        cmd: Command<false, T>,
    ) -> DaliSendResult {
        let flags = if T { SEND_TWICE } else { NO_FLAG };
        sender.send_frame(DaliFrame::Frame16(cmd.0), flags).await
    }

    /// Send a query and require its backward frame.
    pub async fn query(sender: &dyn FrameSender, cmd: Command<true, false>) -> DaliSendResult {
        sender
            .send_frame(DaliFrame::Frame16(cmd.0), EXPECT_ANSWER)
            .await
    }

    /// Direct arc power control.
    pub async fn level<A>(sender: &dyn FrameSender, addr: A, level: u8) -> DaliSendResult
    where
        A: Into<AddressByte>,
    {
        sender
            .send_frame(DaliFrame::Frame16(DAPC(addr, level).0), NO_FLAG)
            .await
    }
}
