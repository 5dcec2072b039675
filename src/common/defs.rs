/// MASK, the "no value" marker used throughout IEC 62386 for levels,
/// scenes and unprogrammed short addresses.
pub const MASK: u8 = 0xff;

/// Answer byte for YES replies to yes/no queries.
pub const YES: u8 = 0xff;

/// Top of the 24-bit random/search address space, exclusive.
pub const SEARCH_ADDR_SPAN: u32 = 0x100_0000;

/// Highest valid search address; comparing against it matches every
/// device still taking part in initialisation.
pub const SEARCH_ADDR_MAX: u32 = 0xff_ffff;
