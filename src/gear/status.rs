use std::fmt;

pub const GEAR_FAILURE: u8 = 0x01;
pub const LAMP_FAILURE: u8 = 0x02;
pub const LAMP_ON: u8 = 0x04;
pub const LIMIT_ERROR: u8 = 0x08;
pub const FADE_RUNNING: u8 = 0x10;
pub const RESET_STATE: u8 = 0x20;
pub const NO_ADDRESS: u8 = 0x40;
pub const POWER_CYCLE: u8 = 0x80;

/// Decoded answer of QUERY STATUS.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GearStatus(u8);

impl GearStatus {
    pub fn new(status: u8) -> GearStatus {
        GearStatus(status)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn gear_failure(&self) -> bool {
        self.0 & GEAR_FAILURE != 0
    }

    pub fn lamp_failure(&self) -> bool {
        self.0 & LAMP_FAILURE != 0
    }

    pub fn lamp_on(&self) -> bool {
        self.0 & LAMP_ON != 0
    }

    pub fn limit_error(&self) -> bool {
        self.0 & LIMIT_ERROR != 0
    }

    pub fn fade_running(&self) -> bool {
        self.0 & FADE_RUNNING != 0
    }

    pub fn reset_state(&self) -> bool {
        self.0 & RESET_STATE != 0
    }

    pub fn missing_short_address(&self) -> bool {
        self.0 & NO_ADDRESS != 0
    }

    pub fn power_cycle_seen(&self) -> bool {
        self.0 & POWER_CYCLE != 0
    }
}

impl fmt::Display for GearStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (GEAR_FAILURE, "gear failure"),
            (LAMP_FAILURE, "lamp failure"),
            (LAMP_ON, "lamp on"),
            (LIMIT_ERROR, "limit error"),
            (FADE_RUNNING, "fade running"),
            (RESET_STATE, "reset state"),
            (NO_ADDRESS, "no address"),
            (POWER_CYCLE, "power cycle"),
        ];
        let strs: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.0 & flag != 0)
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&strs.join(", "))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flags() {
        let s = GearStatus::new(LAMP_ON | NO_ADDRESS);
        assert!(s.lamp_on());
        assert!(s.missing_short_address());
        assert!(!s.lamp_failure());
        assert_eq!(s.to_string(), "lamp on, no address");
    }
}
