//! Control gear state machine for the simulated bus, close enough to
//! IEC 62386-102 for the protocol engine to be exercised end to end.

use crate::common::defs::{MASK, SEARCH_ADDR_SPAN, YES};
use crate::gear::cmd_defs::is_special_byte;
use crate::gear::status;
use rand::Rng;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Window in which the second transmission of a send-twice command must
/// arrive to take effect.
const TWICE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, PartialEq, Eq)]
enum InitState {
    Disabled,
    Enabled,
    Withdrawn,
}

pub struct SimGear {
    pub actual_level: u8,
    pub last_active_level: u8,
    pub power_on_level: u8,
    pub min_level: u8,
    pub max_level: u8,
    /// MASK when unaddressed.
    pub short_address: u8,
    pub random_address: u32,
    pub search_address: u32,
    pub gear_groups: u16,
    /// Addresses to take on the next RANDOMISE commands, for
    /// deterministic tests. When empty the gear rolls properly.
    pub random_plan: VecDeque<u32>,
    /// Stay silent on READ MEMORY LOCATION, like gear that dropped off
    /// the bus between addressing and identification.
    pub fail_memory_reads: bool,
    stored_status: u8,
    init_state: InitState,
    dtr0: u8,
    dtr1: u8,
    dtr2: u8,
    bank0: [u8; 0x1b],
    pending_twice: Option<([u8; 2], Instant)>,
}

fn build_bank0(gtin: u64, serial: u64, index: u8) -> [u8; 0x1b] {
    let mut bank0 = [0u8; 0x1b];
    bank0[0x00] = 0x1a; // last addressable location
    bank0[0x02] = 0x00; // last accessible bank
    bank0[0x03..=0x08].copy_from_slice(&gtin.to_be_bytes()[2..8]);
    bank0[0x09..=0x0a].copy_from_slice(&[0x01, 0x00]);
    bank0[0x0b..=0x12].copy_from_slice(&serial.to_be_bytes());
    bank0[0x13..=0x14].copy_from_slice(&[0x01, 0x00]);
    bank0[0x15] = 0x08; // 2.0
    bank0[0x16] = 0x08;
    bank0[0x17] = 0xff;
    bank0[0x18] = 0;
    bank0[0x19] = 1;
    bank0[0x1a] = index;
    bank0
}

impl SimGear {
    pub fn new(gtin: u64, serial: u64) -> SimGear {
        SimGear {
            actual_level: 0,
            last_active_level: 0xfe,
            power_on_level: 0xfe,
            min_level: 0x01,
            max_level: 0xfe,
            short_address: MASK,
            random_address: 0xff_ffff,
            search_address: 0xff_ffff,
            gear_groups: 0,
            random_plan: VecDeque::new(),
            fail_memory_reads: false,
            stored_status: 0,
            init_state: InitState::Disabled,
            dtr0: 0,
            dtr1: 0,
            dtr2: 0,
            bank0: build_bank0(gtin, serial, 0),
            pending_twice: None,
        }
    }

    /// Preset the address taken at the next RANDOMISE.
    pub fn with_random(mut self, addr: u32) -> SimGear {
        self.random_plan.push_back(addr);
        self
    }

    pub fn with_short_address(mut self, addr: u8) -> SimGear {
        self.short_address = addr;
        self
    }

    pub fn unique_id_parts(&self) -> (u64, u64, u8) {
        let mut gtin = [0u8; 8];
        gtin[2..8].copy_from_slice(&self.bank0[0x03..=0x08]);
        let mut serial = [0u8; 8];
        serial.copy_from_slice(&self.bank0[0x0b..=0x12]);
        (
            u64::from_be_bytes(gtin),
            u64::from_be_bytes(serial),
            self.bank0[0x1a],
        )
    }

    fn status(&self) -> u8 {
        self.stored_status
            | if self.actual_level > 0 { status::LAMP_ON } else { 0 }
            | if self.short_address == MASK {
                status::NO_ADDRESS
            } else {
                0
            }
    }

    fn set_level(&mut self, level: u8) {
        let level = if level == MASK {
            self.last_active_level
        } else {
            level
        };
        let level = if level == 0 {
            0
        } else {
            level.clamp(self.min_level, self.max_level)
        };
        if level > 0 {
            self.last_active_level = level;
        }
        self.actual_level = level;
    }

    fn matches_address(&self, selector: u8) -> bool {
        match selector {
            a @ 0x00..=0x3f => self.short_address == a,
            a @ 0x40..=0x4f => self.gear_groups & (1 << (a & 0x0f)) != 0,
            0x7e => self.short_address == MASK,
            0x7f => true,
            _ => false,
        }
    }

    /// True once the same frame has been seen twice inside the window.
    fn twice_armed(&mut self, frame: [u8; 2]) -> bool {
        let now = Instant::now();
        match self.pending_twice.take() {
            Some((pending, at)) if pending == frame && now.duration_since(at) <= TWICE_WINDOW => {
                true
            }
            _ => {
                self.pending_twice = Some((frame, now));
                false
            }
        }
    }

    fn roll_random_address(&mut self) {
        self.random_address = match self.random_plan.pop_front() {
            Some(addr) => addr,
            None => rand::thread_rng().gen_range(0..SEARCH_ADDR_SPAN),
        };
    }

    /// Process a 16-bit forward frame. The returned byte is this gear's
    /// backward frame, if it answers.
    pub fn receive_frame16(&mut self, frame: [u8; 2]) -> Option<u8> {
        let [addr_byte, data] = frame;
        if is_special_byte(addr_byte) {
            return self.special_cmd(frame);
        }
        if addr_byte & 1 == 0 {
            // direct arc power
            if self.matches_address(addr_byte >> 1) {
                self.set_level(data);
            }
            return None;
        }
        if self.matches_address(addr_byte >> 1) {
            return self.device_cmd(frame);
        }
        None
    }

    fn device_cmd(&mut self, frame: [u8; 2]) -> Option<u8> {
        let op = frame[1];
        // configuration commands only act when sent twice
        if (0x20..=0x81).contains(&op) && !self.twice_armed(frame) {
            return None;
        }
        match op {
            0x00 => self.actual_level = 0,
            0x05 => self.set_level(self.max_level),
            0x06 => self.set_level(self.min_level),
            0x0a => self.set_level(self.last_active_level),
            0x2d => self.power_on_level = self.dtr0,
            0x80 => {
                self.short_address = if self.dtr0 == MASK {
                    MASK
                } else {
                    self.dtr0 >> 1
                }
            }
            0x90 => return Some(self.status()),
            0x91 => return Some(YES),
            0x96 => {
                if self.short_address == MASK {
                    return Some(YES);
                }
            }
            0x98 => return Some(self.dtr0),
            0xa0 => return Some(self.actual_level),
            0xa1 => return Some(self.max_level),
            0xa2 => return Some(self.min_level),
            0xa3 => return Some(self.power_on_level),
            0xc0 => return Some((self.gear_groups & 0xff) as u8),
            0xc1 => return Some((self.gear_groups >> 8) as u8),
            0xc2 => return Some((self.random_address >> 16) as u8),
            0xc3 => return Some((self.random_address >> 8) as u8),
            0xc4 => return Some(self.random_address as u8),
            0xc5 => {
                // indirect memory read; DTR0 advances on success
                if self.fail_memory_reads {
                    return None;
                }
                if self.dtr1 == 0 && (self.dtr0 as usize) < self.bank0.len() {
                    let value = self.bank0[self.dtr0 as usize];
                    self.dtr0 += 1;
                    return Some(value);
                }
            }
            _ => {}
        }
        None
    }

    fn special_cmd(&mut self, frame: [u8; 2]) -> Option<u8> {
        let [op, data] = frame;
        match op {
            0xa1 => self.init_state = InitState::Disabled,
            0xa3 => self.dtr0 = data,
            0xa5 => {
                if self.twice_armed(frame) {
                    let in_scope = data == 0x00
                        || (data == MASK && self.short_address == MASK)
                        || ((data & 0x81) == 0x01 && data >> 1 == self.short_address);
                    if in_scope {
                        self.init_state = InitState::Enabled;
                    }
                }
            }
            0xa7 => {
                if self.twice_armed(frame) && self.init_state != InitState::Disabled {
                    self.roll_random_address();
                }
            }
            0xa9 => {
                if self.init_state == InitState::Enabled
                    && self.random_address <= self.search_address
                {
                    return Some(YES);
                }
            }
            0xab => {
                if self.init_state == InitState::Enabled
                    && self.random_address == self.search_address
                {
                    self.init_state = InitState::Withdrawn;
                }
            }
            0xb1 => {
                if self.init_state != InitState::Disabled {
                    self.search_address =
                        (self.search_address & 0x00_ffff) | ((data as u32) << 16);
                }
            }
            0xb3 => {
                if self.init_state != InitState::Disabled {
                    self.search_address = (self.search_address & 0xff_00ff) | ((data as u32) << 8);
                }
            }
            0xb5 => {
                if self.init_state != InitState::Disabled {
                    self.search_address = (self.search_address & 0xff_ff00) | data as u32;
                }
            }
            0xb7 => {
                if self.init_state != InitState::Disabled
                    && self.search_address == self.random_address
                {
                    if (data & 0x81) == 0x01 {
                        self.short_address = data >> 1;
                    } else if data == MASK {
                        self.short_address = MASK;
                    }
                }
            }
            0xb9 => {
                if self.init_state != InitState::Disabled
                    && data == (self.short_address << 1) | 1
                {
                    return Some(YES);
                }
            }
            0xbb => {
                if self.init_state != InitState::Disabled
                    && self.search_address == self.random_address
                {
                    return Some(if self.short_address == MASK {
                        MASK
                    } else {
                        (self.short_address << 1) | 1
                    });
                }
            }
            0xc3 => self.dtr1 = data,
            0xc5 => self.dtr2 = data,
            _ => {}
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn initialise(gear: &mut SimGear) {
        assert_eq!(gear.receive_frame16([0xa5, 0x00]), None);
        assert_eq!(gear.receive_frame16([0xa5, 0x00]), None);
    }

    #[tokio::test]
    async fn initialise_needs_two_frames() {
        let mut gear = SimGear::new(1, 2);
        gear.receive_frame16([0xa5, 0x00]);
        assert_eq!(gear.init_state, InitState::Disabled);
        gear.receive_frame16([0xa5, 0x00]);
        assert_eq!(gear.init_state, InitState::Enabled);
    }

    #[tokio::test]
    async fn compare_against_search_address() {
        let mut gear = SimGear::new(1, 2).with_random(0x123456);
        initialise(&mut gear);
        gear.receive_frame16([0xa7, 0x00]);
        gear.receive_frame16([0xa7, 0x00]);
        assert_eq!(gear.random_address, 0x123456);

        // search address 0x123456: matches
        gear.receive_frame16([0xb1, 0x12]);
        gear.receive_frame16([0xb3, 0x34]);
        gear.receive_frame16([0xb5, 0x56]);
        assert_eq!(gear.receive_frame16([0xa9, 0x00]), Some(YES));
        // one below: silence
        gear.receive_frame16([0xb5, 0x55]);
        assert_eq!(gear.receive_frame16([0xa9, 0x00]), None);
    }

    #[tokio::test]
    async fn withdraw_stops_compares() {
        let mut gear = SimGear::new(1, 2).with_random(0x000042);
        initialise(&mut gear);
        gear.receive_frame16([0xa7, 0x00]);
        gear.receive_frame16([0xa7, 0x00]);
        gear.receive_frame16([0xb1, 0x00]);
        gear.receive_frame16([0xb3, 0x00]);
        gear.receive_frame16([0xb5, 0x42]);
        gear.receive_frame16([0xab, 0x00]);
        assert_eq!(gear.init_state, InitState::Withdrawn);
        assert_eq!(gear.receive_frame16([0xa9, 0x00]), None);
    }

    #[tokio::test]
    async fn dapc_and_queries() {
        let mut gear = SimGear::new(1, 2).with_short_address(3);
        gear.receive_frame16([3 << 1, 0x80]);
        assert_eq!(gear.actual_level, 0x80);
        assert_eq!(gear.receive_frame16([(3 << 1) | 1, 0xa0]), Some(0x80));
        // other addresses stay silent
        assert_eq!(gear.receive_frame16([(4 << 1) | 1, 0xa0]), None);
        // off, then back to last active level
        gear.receive_frame16([(3 << 1) | 1, 0x00]);
        assert_eq!(gear.actual_level, 0);
        gear.receive_frame16([(3 << 1) | 1, 0x0a]);
        assert_eq!(gear.actual_level, 0x80);
    }

    #[tokio::test]
    async fn memory_read_advances_dtr0() {
        let mut gear = SimGear::new(0x07ee4bb3b889, 0x1a5838920269).with_short_address(0);
        gear.receive_frame16([0xc3, 0x00]);
        gear.receive_frame16([0xa3, 0x03]);
        let first = gear.receive_frame16([0x01, 0xc5]);
        assert_eq!(first, Some(0x07));
        let second = gear.receive_frame16([0x01, 0xc5]);
        assert_eq!(second, Some(0xee));
        assert_eq!(gear.receive_frame16([0x01, 0x98]), Some(0x05));
    }
}
