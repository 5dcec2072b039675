//! DTR-indirect reads of device memory and the bank 0 identity data.

use crate::common::address::Short;
use crate::drivers::command_utils::send16;
use crate::drivers::dispatcher::FrameSender;
use crate::drivers::driver::DaliSendResult;
use crate::gear::cmd_defs as cmd;
use serde::Serialize;
use std::convert::TryInto;
use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum MemoryError {
    /// A read transaction went unanswered; the data would be partial.
    NoResponse,
    /// DTR0 does not match the read length, so the device and we
    /// disagree about what was read.
    LengthMismatch,
    Send(DaliSendResult),
}

impl Error for MemoryError {}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::NoResponse => write!(f, "No response while reading memory"),
            MemoryError::LengthMismatch => write!(f, "DTR0 doesn't match read length"),
            MemoryError::Send(e) => e.fmt(f),
        }
    }
}

impl From<DaliSendResult> for MemoryError {
    fn from(res: DaliSendResult) -> MemoryError {
        MemoryError::Send(res)
    }
}

/// Read `length` bytes from `bank` starting at `start`, one byte per
/// READ MEMORY LOCATION transaction. The device increments DTR0 on each
/// read; the final DTR0 query verifies that nothing was skipped.
pub async fn read_range(
    sender: &dyn FrameSender,
    addr: Short,
    bank: u8,
    start: u8,
    length: u8,
) -> Result<Vec<u8>, MemoryError> {
    send16::cmd(sender, cmd::DTR1(bank)).await.check_send()?;
    send16::cmd(sender, cmd::DTR0(start)).await.check_send()?;
    let mut data = Vec::with_capacity(length as usize);
    for _ in 0..length {
        match send16::query(sender, cmd::READ_MEMORY_LOCATION(addr)).await {
            DaliSendResult::Answer(byte) => data.push(byte),
            DaliSendResult::Timeout => return Err(MemoryError::NoResponse),
            e => return Err(MemoryError::Send(e)),
        }
    }
    let dtr0 = send16::query(sender, cmd::QUERY_CONTENT_DTR0(addr))
        .await
        .check_answer()
        .map_err(MemoryError::Send)?;
    if dtr0 != start.wrapping_add(length) {
        return Err(MemoryError::LengthMismatch);
    }
    Ok(data)
}

/// Identity and version data from memory bank 0, offsets 0x02..=0x1a.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryBank0Info {
    pub gtin: u64,
    pub firmware_version: u16,
    pub id_number: u64,
    pub hardware_version: u16,
    pub version_101: u8,
    pub version_102: u8,
    pub version_103: u8,
    pub n_control_devices: u8,
    pub n_control_gears: u8,
    pub control_gear_index: u8,
}

impl MemoryBank0Info {
    pub fn unique_id(&self) -> UniqueId {
        UniqueId {
            gtin: self.gtin,
            serial: self.id_number,
            index: self.control_gear_index,
        }
    }
}

fn version_str(ver: u8) -> String {
    if ver == 0xff {
        String::from("-")
    } else {
        format!("{}.{}", ver >> 2, ver & 3)
    }
}

impl fmt::Display for MemoryBank0Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GTIN: {}", self.gtin)?;
        writeln!(
            f,
            "Firmware version: {}.{}",
            self.firmware_version >> 8,
            self.firmware_version & 0xff
        )?;
        writeln!(f, "Identification number: {}", self.id_number)?;
        writeln!(
            f,
            "Hardware version: {}.{}",
            self.hardware_version >> 8,
            self.hardware_version & 0xff
        )?;
        writeln!(f, "101 version number: {}", version_str(self.version_101))?;
        writeln!(f, "102 version number: {}", version_str(self.version_102))?;
        writeln!(f, "103 version number: {}", version_str(self.version_103))?;
        writeln!(f, "Logical control gear units: {}", self.n_control_gears)?;
        writeln!(f, "Control gear unit index: {}", self.control_gear_index)?;
        Ok(())
    }
}

/// Permanent identity of one logical control gear.
///
/// The standard guarantees GTIN plus identification number to be
/// globally unique per physical device; the gear index separates the
/// logical units inside one. Derived exclusively from bank 0 contents,
/// never from a short address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct UniqueId {
    pub gtin: u64,
    pub serial: u64,
    pub index: u8,
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}-{:016x}-{}", self.gtin, self.serial, self.index)
    }
}

const BANK0_READ_START: u8 = 0x02;
const BANK0_READ_LEN: u8 = 0x19;

/// Read and parse the identity block of memory bank 0.
pub async fn read_bank_0(
    sender: &dyn FrameSender,
    addr: Short,
) -> Result<MemoryBank0Info, MemoryError> {
    let bytes = read_range(sender, addr, 0, BANK0_READ_START, BANK0_READ_LEN).await?;
    debug_assert_eq!(bytes.len(), BANK0_READ_LEN as usize);
    let mut bank0 = [0u8; 0x1b];
    bank0[0x02..=0x1a].copy_from_slice(&bytes);

    let mut gtin_bytes = [0u8; 8];
    gtin_bytes[2..8].copy_from_slice(&bank0[0x03..=0x08]);
    Ok(MemoryBank0Info {
        gtin: u64::from_be_bytes(gtin_bytes),
        firmware_version: u16::from_be_bytes(bank0[0x09..=0x0a].try_into().unwrap()),
        id_number: u64::from_be_bytes(bank0[0x0b..=0x12].try_into().unwrap()),
        hardware_version: u16::from_be_bytes(bank0[0x13..=0x14].try_into().unwrap()),
        version_101: bank0[0x15],
        version_102: bank0[0x16],
        version_103: bank0[0x17],
        n_control_devices: bank0[0x18],
        n_control_gears: bank0[0x19],
        control_gear_index: bank0[0x1a],
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::drivers::driver::DaliFrame;
    use crate::drivers::send_flags::Flags;
    use crate::utils::dyn_future::DynFuture;
    use std::sync::Mutex;

    /// Serves memory reads for a single device straight from an array.
    struct FakeBank0 {
        bank0: [u8; 0x1b],
        dtr0: Mutex<u8>,
    }

    impl FrameSender for FakeBank0 {
        fn send_frame(&self, frame: DaliFrame, _flags: Flags) -> DynFuture<'_, DaliSendResult> {
            let DaliFrame::Frame16(bytes) = frame else {
                panic!("unexpected frame width");
            };
            let res = match bytes {
                [0xa3, offset] => {
                    *self.dtr0.lock().unwrap() = offset;
                    DaliSendResult::Ok
                }
                [0xc3, 0x00] => DaliSendResult::Ok,
                [addr, 0xc5] if addr & 1 == 1 => {
                    let mut dtr0 = self.dtr0.lock().unwrap();
                    let offset = *dtr0 as usize;
                    *dtr0 += 1;
                    DaliSendResult::Answer(self.bank0[offset])
                }
                [addr, 0x98] if addr & 1 == 1 => {
                    DaliSendResult::Answer(*self.dtr0.lock().unwrap())
                }
                _ => DaliSendResult::Timeout,
            };
            Box::pin(std::future::ready(res))
        }
    }

    // The sample bank 0 dump the wire notes were taken from:
    // 01 07ee4bb3b889 0707 00001a5838920269 0300 08
    fn sample_bank0() -> [u8; 0x1b] {
        let mut bank0 = [0u8; 0x1b];
        bank0[0x00] = 0x1a;
        bank0[0x02] = 0x01;
        bank0[0x03..=0x08].copy_from_slice(&[0x07, 0xee, 0x4b, 0xb3, 0xb8, 0x89]);
        bank0[0x09..=0x0a].copy_from_slice(&[0x07, 0x07]);
        bank0[0x0b..=0x12].copy_from_slice(&[0x00, 0x00, 0x1a, 0x58, 0x38, 0x92, 0x02, 0x69]);
        bank0[0x13..=0x14].copy_from_slice(&[0x03, 0x00]);
        bank0[0x15] = 0x08;
        bank0[0x18] = 1;
        bank0[0x19] = 1;
        bank0[0x1a] = 0;
        bank0
    }

    #[tokio::test]
    async fn parse_bank_0() {
        let fake = FakeBank0 {
            bank0: sample_bank0(),
            dtr0: Mutex::new(0),
        };
        let info = read_bank_0(&fake, Short::new(0)).await.unwrap();
        assert_eq!(info.gtin, 0x07ee4bb3b889);
        assert_eq!(info.firmware_version, 0x0707);
        assert_eq!(info.id_number, 0x00001a5838920269);
        assert_eq!(info.hardware_version, 0x0300);
        assert_eq!(info.version_101, 0x08);
        assert_eq!(info.control_gear_index, 0);
        assert_eq!(
            info.unique_id().to_string(),
            "07ee4bb3b889-00001a5838920269-0"
        );
    }

    #[tokio::test]
    async fn silent_device_is_no_response() {
        struct Silent;
        impl FrameSender for Silent {
            fn send_frame(&self, _: DaliFrame, flags: Flags) -> DynFuture<'_, DaliSendResult> {
                Box::pin(std::future::ready(if flags.expect_answer() {
                    DaliSendResult::Timeout
                } else {
                    DaliSendResult::Ok
                }))
            }
        }
        match read_bank_0(&Silent, Short::new(5)).await {
            Err(MemoryError::NoResponse) => {}
            r => panic!("expected NoResponse, got {:?}", r),
        }
    }
}
