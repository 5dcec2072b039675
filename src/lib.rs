pub mod error;

pub mod common {
    pub mod address;
    pub mod defs;
}

pub mod gear {
    pub mod cmd_defs;
    pub mod status;
}

pub mod drivers;

pub mod utils {
    pub mod discover;
    pub mod dyn_future;
    pub mod long_address;
    pub mod memory_banks;
}

pub mod bus;
