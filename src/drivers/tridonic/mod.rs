pub mod codec;

#[cfg(feature = "tridonic")]
pub mod usb;
