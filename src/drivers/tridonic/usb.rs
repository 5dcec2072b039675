//! Transport for the Tridonic DALI-USB adapter.
//!
//! The adapter is a HID-class device; packets move over a pair of
//! interrupt endpoints. A plain reader thread feeds received packets
//! into a channel, writes go through short blocking tasks.

use super::codec::{RECV_PACKET_SIZE, SEND_PACKET_SIZE};
use crate::drivers::driver::{DriverInfo, OpenError};
use crate::drivers::transport::{ConnectionError, Transport};
use crate::utils::dyn_future::DynFuture;
use log::{debug, warn};
use nusb::transfer::{In, Interrupt, Out};
use nusb::{list_devices, Interface, MaybeFuture};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const VENDOR_ID: u16 = 0x17b5;
pub const PRODUCT_ID: u16 = 0x0020;

const READ_QUEUE_DEPTH: usize = 64;

/// One attached adapter, not yet opened.
pub struct TransceiverInfo {
    pub serial_number: Option<String>,
    device_info: nusb::DeviceInfo,
}

impl std::fmt::Display for TransceiverInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.serial_number {
            Some(serial) => write!(f, "Tridonic DALI-USB serial={}", serial),
            None => write!(f, "Tridonic DALI-USB"),
        }
    }
}

/// All attached adapters, without opening any of them.
pub fn transceivers() -> Result<Vec<TransceiverInfo>, ConnectionError> {
    let devices = list_devices()
        .wait()
        .map_err(|e| ConnectionError::Device(e.to_string()))?;
    Ok(devices
        .filter(|d| d.vendor_id() == VENDOR_ID && d.product_id() == PRODUCT_ID)
        .map(|device_info| TransceiverInfo {
            serial_number: device_info.serial_number().map(str::to_string),
            device_info,
        })
        .collect())
}

impl TransceiverInfo {
    pub fn open(&self) -> Result<TridonicTransport, ConnectionError> {
        let device = self
            .device_info
            .open()
            .wait()
            .map_err(|e| ConnectionError::Device(e.to_string()))?;
        // The kernel HID driver holds the interface until detached.
        let interface = device
            .detach_and_claim_interface(0)
            .wait()
            .map_err(|e| ConnectionError::Device(e.to_string()))?;

        let mut in_endpoint = 0u8;
        let mut out_endpoint = 0u8;
        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() != 0 {
                    continue;
                }
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() == nusb::descriptors::TransferType::Interrupt {
                            if ep.direction() == nusb::transfer::Direction::In {
                                in_endpoint = ep.address();
                            } else {
                                out_endpoint = ep.address();
                            }
                        }
                    }
                }
            }
        }
        if in_endpoint == 0 || out_endpoint == 0 {
            return Err(ConnectionError::Device(
                "No interrupt endpoints found".to_string(),
            ));
        }
        debug!(
            "Opened {} (in 0x{:02x}, out 0x{:02x})",
            self, in_endpoint, out_endpoint
        );

        let (tx, rx) = mpsc::channel(READ_QUEUE_DEPTH);
        let reader_interface = interface.clone();
        std::thread::Builder::new()
            .name("tridonic-read".to_string())
            .spawn(move || read_loop(reader_interface, in_endpoint, tx))
            .map_err(ConnectionError::Io)?;

        Ok(TridonicTransport {
            interface,
            out_endpoint,
            recv: rx,
            closed: false,
        })
    }
}

/// Reads packets until the device goes away or the transport is
/// dropped. The thread parks in the kernel between packets, so it only
/// notices a dropped receiver on the next packet or on unplug.
fn read_loop(interface: Interface, in_endpoint: u8, tx: mpsc::Sender<Vec<u8>>) {
    let ep = match interface.endpoint::<Interrupt, In>(in_endpoint) {
        Ok(ep) => ep,
        Err(e) => {
            warn!("Failed to claim IN endpoint: {}", e);
            return;
        }
    };
    let mut reader = ep.reader(RECV_PACKET_SIZE.max(64));
    let mut buf = [0u8; RECV_PACKET_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("USB read failed: {}", e);
                break;
            }
        }
    }
    debug!("Reader finished");
}

pub struct TridonicTransport {
    interface: Interface,
    out_endpoint: u8,
    recv: mpsc::Receiver<Vec<u8>>,
    closed: bool,
}

impl Transport for TridonicTransport {
    fn write(&mut self, data: &[u8]) -> DynFuture<'_, Result<(), ConnectionError>> {
        if self.closed {
            return Box::pin(std::future::ready(Err(ConnectionError::Closed)));
        }
        let interface = self.interface.clone();
        let endpoint = self.out_endpoint;
        let data = data.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let ep = interface
                    .endpoint::<Interrupt, Out>(endpoint)
                    .map_err(|e| ConnectionError::Device(e.to_string()))?;
                let mut writer = ep.writer(SEND_PACKET_SIZE);
                writer.write_all(&data)?;
                writer.flush()?;
                Ok(())
            })
            .await
            .map_err(|e| ConnectionError::Device(e.to_string()))?
        })
    }

    fn read_timeout(
        &mut self,
        wait: Duration,
    ) -> DynFuture<'_, Result<Option<Vec<u8>>, ConnectionError>> {
        Box::pin(async move {
            if self.closed {
                return Err(ConnectionError::Closed);
            }
            match timeout(wait, self.recv.recv()).await {
                Ok(Some(data)) => Ok(Some(data)),
                Ok(None) => Err(ConnectionError::Closed),
                Err(_) => Ok(None),
            }
        })
    }

    fn close(&mut self) -> DynFuture<'_, Result<(), ConnectionError>> {
        self.closed = true;
        self.recv.close();
        Box::pin(std::future::ready(Ok(())))
    }
}

fn driver_open(params: HashMap<String, String>) -> Result<Box<dyn Transport>, OpenError> {
    let found = transceivers().map_err(|e| OpenError::DriverError(Box::new(e)))?;
    let info = match params.get("serial") {
        Some(serial) => found
            .into_iter()
            .find(|t| t.serial_number.as_deref() == Some(serial.as_str())),
        None => found.into_iter().next(),
    }
    .ok_or_else(|| OpenError::DriverError(Box::new(ConnectionError::NotFound)))?;
    let transport = info
        .open()
        .map_err(|e| OpenError::DriverError(Box::new(e)))?;
    Ok(Box::new(transport))
}

pub fn driver_info() -> DriverInfo {
    DriverInfo {
        name: "tridonic".to_string(),
        description: "Tridonic DALI-USB adapter, add serial=N to pick one".to_string(),
        open: driver_open,
    }
}
