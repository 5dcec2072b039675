pub mod driver;
pub use driver::driver_names;
pub use driver::open;

pub mod command_utils;
pub mod dispatcher;
pub mod send_flags;
pub mod transport;
pub mod tridonic;

#[cfg(feature = "simulator")]
pub mod simulator;

#[allow(unused_imports)] // in case no drivers are enabled
use driver::add_driver;
use crate::error::DynResult;

/// Register every transport backend enabled at build time.
pub fn init() -> DynResult<()> {
    #[cfg(feature = "tridonic")]
    add_driver(tridonic::usb::driver_info());
    #[cfg(feature = "simulator")]
    add_driver(simulator::bus::driver_info());
    Ok(())
}
