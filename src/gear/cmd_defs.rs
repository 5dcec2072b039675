//! The 16-bit command set of IEC 62386-102, transcribed in full.
//!
//! Whether a command expects a backward frame and whether it must be
//! transmitted twice to take effect is part of the command definition,
//! not something callers decide, so both are carried as const parameters
//! of [`Command`] and checked at construction time.

use crate::common::address::AddressByte;

/// A fully encoded 16-bit forward frame.
///
/// `ANSWER`: the addressed device answers with a backward frame.
/// `TWICE`: the frame only takes effect when received twice within the
/// retransmission window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Command<const ANSWER: bool, const TWICE: bool>(pub [u8; 2]);

macro_rules! frame_type {
    () => { Command<false, false> };
    (answer) => { Command<true, false> };
    (twice) => { Command<false, true> };
}

/// Commands addressed to a device, group or broadcast.
macro_rules! addressed_cmds {
    ($($(#[$doc:meta])* $name:ident = $op:literal $(=> $kind:ident)?;)*) => {
        $(
            $(#[$doc])*
            #[allow(non_snake_case)]
            #[inline(always)]
            pub fn $name<A>(addr: A) -> frame_type!($($kind)?)
            where
                A: Into<AddressByte>,
            {
                Command([addr.into().0, $op])
            }
        )*
    };
}

/// Addressed commands whose opcode carries a 4-bit scene or group number.
macro_rules! indexed_cmds {
    ($($(#[$doc:meta])* $name:ident = $op:literal $(=> $kind:ident)?;)*) => {
        $(
            $(#[$doc])*
            #[allow(non_snake_case)]
            #[inline(always)]
            pub fn $name<A>(addr: A, index: u8) -> frame_type!($($kind)?)
            where
                A: Into<AddressByte>,
            {
                debug_assert!(index < 16);
                Command([addr.into().0, $op | (index & 0x0f)])
            }
        )*
    };
}

/// Special commands with a fixed second byte.
macro_rules! special_cmds {
    ($($(#[$doc:meta])* $name:ident = [$b1:literal, $b2:literal] $(=> $kind:ident)?;)*) => {
        $(
            $(#[$doc])*
            #[allow(non_snake_case)]
            #[inline(always)]
            pub const fn $name() -> frame_type!($($kind)?) {
                Command([$b1, $b2])
            }
        )*
    };
}

/// Special commands carrying a data byte.
macro_rules! special_data_cmds {
    ($($(#[$doc:meta])* $name:ident = $b1:literal $(=> $kind:ident)?;)*) => {
        $(
            $(#[$doc])*
            #[allow(non_snake_case)]
            #[inline(always)]
            pub const fn $name(data: u8) -> frame_type!($($kind)?) {
                Command([$b1, data])
            }
        )*
    };
}

/// Direct arc power control. The only command with the level selector
/// bit cleared in the address byte.
#[allow(non_snake_case)]
#[inline(always)]
pub fn DAPC<A>(addr: A, level: u8) -> Command<false, false>
where
    A: Into<AddressByte>,
{
    Command([addr.into().0 & 0xfe, level])
}

addressed_cmds! {
    /// Switch off without fading.
    OFF = 0x00;
    UP = 0x01;
    DOWN = 0x02;
    STEP_UP = 0x03;
    STEP_DOWN = 0x04;
    RECALL_MAX_LEVEL = 0x05;
    RECALL_MIN_LEVEL = 0x06;
    STEP_DOWN_AND_OFF = 0x07;
    ON_AND_STEP_UP = 0x08;
    ENABLE_DAPC_SEQUENCE = 0x09;
    GO_TO_LAST_ACTIVE_LEVEL = 0x0a;

    RESET = 0x20 => twice;
    STORE_ACTUAL_LEVEL_IN_DTR0 = 0x21 => twice;
    SAVE_PERSISTENT_VARIABLES = 0x22 => twice;
    SET_OPERATING_MODE = 0x23 => twice;
    RESET_MEMORY_BANK = 0x24 => twice;
    IDENTIFY_DEVICE = 0x25 => twice;
    SET_MAX_LEVEL = 0x2a => twice;
    SET_MIN_LEVEL = 0x2b => twice;
    SET_SYSTEM_FAILURE_LEVEL = 0x2c => twice;
    SET_POWER_ON_LEVEL = 0x2d => twice;
    SET_FADE_TIME = 0x2e => twice;
    SET_FADE_RATE = 0x2f => twice;
    SET_EXTENDED_FADE_TIME = 0x30 => twice;

    SET_SHORT_ADDRESS = 0x80 => twice;
    ENABLE_WRITE_MEMORY = 0x81 => twice;

    QUERY_STATUS = 0x90 => answer;
    QUERY_CONTROL_GEAR_PRESENT = 0x91 => answer;
    QUERY_LAMP_FAILURE = 0x92 => answer;
    QUERY_LAMP_POWER_ON = 0x93 => answer;
    QUERY_LIMIT_ERROR = 0x94 => answer;
    QUERY_RESET_STATE = 0x95 => answer;
    QUERY_MISSING_SHORT_ADDRESS = 0x96 => answer;
    QUERY_VERSION_NUMBER = 0x97 => answer;
    QUERY_CONTENT_DTR0 = 0x98 => answer;
    QUERY_DEVICE_TYPE = 0x99 => answer;
    QUERY_PHYSICAL_MINIMUM = 0x9a => answer;
    QUERY_POWER_FAILURE = 0x9b => answer;
    QUERY_CONTENT_DTR1 = 0x9c => answer;
    QUERY_CONTENT_DTR2 = 0x9d => answer;
    QUERY_OPERATING_MODE = 0x9e => answer;
    QUERY_LIGHT_SOURCE_TYPE = 0x9f => answer;
    QUERY_ACTUAL_LEVEL = 0xa0 => answer;
    QUERY_MAX_LEVEL = 0xa1 => answer;
    QUERY_MIN_LEVEL = 0xa2 => answer;
    QUERY_POWER_ON_LEVEL = 0xa3 => answer;
    QUERY_SYSTEM_FAILURE_LEVEL = 0xa4 => answer;
    QUERY_FADE = 0xa5 => answer;
    QUERY_MANUFACTURER_SPECIFIC_MODE = 0xa6 => answer;
    QUERY_NEXT_DEVICE_TYPE = 0xa7 => answer;
    QUERY_EXTENDED_FADE_TIME = 0xa8 => answer;
    QUERY_CONTROL_GEAR_FAILURE = 0xaa => answer;
    QUERY_GROUPS_0_7 = 0xc0 => answer;
    QUERY_GROUPS_8_15 = 0xc1 => answer;
    QUERY_RANDOM_ADDRESS_H = 0xc2 => answer;
    QUERY_RANDOM_ADDRESS_M = 0xc3 => answer;
    QUERY_RANDOM_ADDRESS_L = 0xc4 => answer;
    /// Answers the byte of the memory bank selected by DTR1 at the
    /// offset in DTR0, then increments DTR0.
    READ_MEMORY_LOCATION = 0xc5 => answer;
    QUERY_EXTENDED_VERSION_NUMBER = 0xff => answer;
}

indexed_cmds! {
    GO_TO_SCENE = 0x10;
    SET_SCENE = 0x40 => twice;
    REMOVE_FROM_SCENE = 0x50 => twice;
    ADD_TO_GROUP = 0x60 => twice;
    REMOVE_FROM_GROUP = 0x70 => twice;
    QUERY_SCENE_LEVEL = 0xb0 => answer;
}

special_cmds! {
    /// Leave initialisation mode.
    TERMINATE = [0xa1, 0x00];
    RANDOMISE = [0xa7, 0x00] => twice;
    /// Answers YES if any initialised device has a random address at or
    /// below the current search address. Several devices answering at
    /// once is seen as a framing error.
    COMPARE = [0xa9, 0x00] => answer;
    WITHDRAW = [0xab, 0x00];
    PING = [0xad, 0x00];
    QUERY_SHORT_ADDRESS = [0xbb, 0x00] => answer;
}

special_data_cmds! {
    /// Enter initialisation mode. Data selects the scope: 0x00 all
    /// devices, 0xff only devices without a short address, or
    /// `short.command_byte()` for one device.
    INITIALISE = 0xa5 => twice;
    SEARCHADDRH = 0xb1;
    SEARCHADDRM = 0xb3;
    SEARCHADDRL = 0xb5;
    /// Data is `short.command_byte()`, or MASK to clear.
    PROGRAM_SHORT_ADDRESS = 0xb7;
    VERIFY_SHORT_ADDRESS = 0xb9 => answer;
    ENABLE_DEVICE_TYPE = 0xc1;
    DTR0 = 0xa3;
    DTR1 = 0xc3;
    DTR2 = 0xc5;
    WRITE_MEMORY_LOCATION = 0xc7 => answer;
    WRITE_MEMORY_LOCATION_NO_REPLY = 0xc9;
}

/// Initialisation scope byte: every device on the bus.
pub const INITIALISE_ALL: u8 = 0x00;
/// Initialisation scope byte: only devices without a short address.
pub const INITIALISE_UNADDRESSED: u8 = 0xff;

/// Second byte of special command address bytes is always odd; use this
/// to tell special frames from addressed frames when decoding.
pub fn is_special_byte(addr_byte: u8) -> bool {
    (0xa0..=0xcb).contains(&addr_byte) && (addr_byte & 1) == 1
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::address::{Address, Short};

    #[test]
    fn addressed_encoding() {
        let c = OFF(Short::new(3));
        assert_eq!(c.0, [0x07, 0x00]);
        let c = QUERY_STATUS(Address::Broadcast);
        assert_eq!(c.0, [0xff, 0x90]);
        let c = SET_MAX_LEVEL(Short::new(0));
        assert_eq!(c.0, [0x01, 0x2a]);
    }

    #[test]
    fn dapc_clears_selector_bit() {
        let c = DAPC(Short::new(5), 0x80);
        assert_eq!(c.0, [0x0a, 0x80]);
        let c = DAPC(Address::Broadcast, 0xfe);
        assert_eq!(c.0, [0xfe, 0xfe]);
    }

    #[test]
    fn special_encoding() {
        assert_eq!(TERMINATE().0, [0xa1, 0x00]);
        assert_eq!(RANDOMISE().0, [0xa7, 0x00]);
        assert_eq!(COMPARE().0, [0xa9, 0x00]);
        assert_eq!(INITIALISE(INITIALISE_UNADDRESSED).0, [0xa5, 0xff]);
        assert_eq!(SEARCHADDRM(0x34).0, [0xb3, 0x34]);
        assert_eq!(PROGRAM_SHORT_ADDRESS(Short::new(2).command_byte()).0, [0xb7, 0x05]);
    }

    #[test]
    fn special_byte_detection() {
        assert!(is_special_byte(0xa1));
        assert!(is_special_byte(0xc5));
        assert!(!is_special_byte(0x07));
        assert!(!is_special_byte(0xff));
        assert!(!is_special_byte(0xfe));
    }

    #[test]
    fn indexed_encoding() {
        assert_eq!(GO_TO_SCENE(Short::new(1), 4).0, [0x03, 0x14]);
        assert_eq!(ADD_TO_GROUP(Address::Broadcast, 15).0, [0xff, 0x6f]);
    }
}
