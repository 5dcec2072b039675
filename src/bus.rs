//! Session facade for one bus: owns the dispatcher, the device
//! registry, and hands out [`Gear`] handles keyed by unique id.

use crate::common::address::Short;
use crate::drivers::command_utils::send16;
use crate::drivers::dispatcher::{self, BusHandle, ListenerHandle};
use crate::drivers::driver::{self, DaliBusEvent, DaliSendResult, OpenError};
use crate::drivers::transport::Transport;
use crate::gear::cmd_defs as cmd;
use crate::gear::status::GearStatus;
use crate::utils::discover::{self, ScanControl, ScanError, ScanOptions};
use crate::utils::memory_banks::{self, MemoryBank0Info, MemoryError, UniqueId};
use log::{debug, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

/// One physical control gear endpoint, keyed by its permanent identity.
/// The short address is only the current way to reach it.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub unique_id: UniqueId,
    pub info: MemoryBank0Info,
    pub short_address: Option<Short>,
}

/// All devices ever confirmed on this bus, unique id -> device. Records
/// are never dropped implicitly; a full rescan that no longer sees a
/// device only clears its short address.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<UniqueId, Device>,
}

impl DeviceRegistry {
    fn upsert(&mut self, info: MemoryBank0Info, short: Short) -> Device {
        let unique_id = info.unique_id();
        // A short address can only be held by one device; whoever had
        // it before is stale.
        for other in self.devices.values_mut() {
            if other.unique_id != unique_id && other.short_address == Some(short) {
                other.short_address = None;
            }
        }
        let device = Device {
            unique_id,
            info,
            short_address: Some(short),
        };
        self.devices.insert(unique_id, device.clone());
        device
    }

    fn clear_missing(&mut self, seen: &HashSet<UniqueId>) {
        for device in self.devices.values_mut() {
            if !seen.contains(&device.unique_id) {
                device.short_address = None;
            }
        }
    }

    /// Bitmask of short addresses recorded for known devices.
    fn reserved_mask(&self) -> u64 {
        self.devices
            .values()
            .filter_map(|d| d.short_address)
            .fold(0u64, |mask, short| mask | 1 << short.value())
    }

    pub fn short_address(&self, unique_id: &UniqueId) -> Option<Short> {
        self.devices.get(unique_id).and_then(|d| d.short_address)
    }

    pub fn get(&self, unique_id: &UniqueId) -> Option<&Device> {
        self.devices.get(unique_id)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }
}

#[derive(Debug)]
pub enum GearError {
    /// The unique id has no usable short address; rescan first.
    DeviceNotAddressed,
    Send(DaliSendResult),
}

impl Error for GearError {}

impl fmt::Display for GearError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GearError::DeviceNotAddressed => write!(f, "Device has no short address"),
            GearError::Send(e) => e.fmt(f),
        }
    }
}

impl From<DaliSendResult> for GearError {
    fn from(res: DaliSendResult) -> GearError {
        GearError::Send(res)
    }
}

/// Identity of one addressed device could not be read; it keeps its
/// short address but is not registered.
#[derive(Debug)]
pub struct ScanFailure {
    pub short: Short,
    pub error: MemoryError,
}

/// Outcome of [`DaliBus::scan_for_gear`]: every device confirmed in
/// this scan (new or reconfirmed, matched by unique id) plus the
/// addresses whose identity could not be resolved.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub devices: Vec<Device>,
    pub failures: Vec<ScanFailure>,
}

/// An open session on one physical bus.
pub struct DaliBus {
    handle: BusHandle,
    registry: Arc<Mutex<DeviceRegistry>>,
    join: Option<JoinHandle<()>>,
}

impl DaliBus {
    pub fn new(transport: Box<dyn Transport>) -> DaliBus {
        let (handle, join) = dispatcher::start(transport);
        DaliBus {
            handle,
            registry: Arc::new(Mutex::new(DeviceRegistry::default())),
            join: Some(join),
        }
    }

    /// Open a bus through the driver registry, e.g. `"tridonic"`,
    /// `"tridonic:serial=0123"` or `"sim:gears=3"`.
    pub fn open(target: &str) -> Result<DaliBus, OpenError> {
        driver::open(target).map(DaliBus::new)
    }

    /// Find every device on the bus and give unaddressed ones a short
    /// address; see [`discover::assign_short_addresses`] for the
    /// addressing protocol. Ordinary traffic fails with `Busy` while
    /// the scan runs.
    pub async fn scan_for_gear(&self, options: ScanOptions) -> Result<ScanReport, ScanError> {
        self.scan_for_gear_cancellable(options, &ScanControl::new())
            .await
    }

    pub async fn scan_for_gear_cancellable(
        &self,
        options: ScanOptions,
        control: &ScanControl,
    ) -> Result<ScanReport, ScanError> {
        let guard = self.handle.lock_exclusive().map_err(ScanError::Send)?;

        let occupied = discover::probe_short_addresses(&guard).await?;
        let reserved = occupied | self.registry.lock().unwrap().reserved_mask();
        let assignments =
            discover::assign_short_addresses(&guard, options, reserved, control).await?;

        // Resolve identities: everything that answered the probe (gone
        // after a full rescan wiped the addresses) plus everything just
        // addressed.
        let mut to_resolve: Vec<Short> = if options.full {
            Vec::new()
        } else {
            Short::all()
                .filter(|a| occupied & (1 << a.value()) != 0)
                .collect()
        };
        to_resolve.extend(assignments.iter().map(|a| a.short));

        let mut report = ScanReport::default();
        let mut seen = HashSet::new();
        for short in to_resolve {
            match memory_banks::read_bank_0(&guard, short).await {
                Ok(info) => {
                    debug!("{}: {}", short, info.unique_id());
                    let device = self.registry.lock().unwrap().upsert(info, short);
                    seen.insert(device.unique_id);
                    report.devices.push(device);
                }
                Err(error) => {
                    warn!("{}: identity read failed: {}", short, error);
                    report.failures.push(ScanFailure { short, error });
                }
            }
        }
        if options.full {
            self.registry.lock().unwrap().clear_missing(&seen);
        }
        Ok(report)
    }

    /// Handle for one device. Works for any unique id; operations fail
    /// with [`GearError::DeviceNotAddressed`] until a scan has
    /// confirmed the device.
    pub fn gear(&self, unique_id: UniqueId) -> Gear {
        Gear {
            unique_id,
            handle: self.handle.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Snapshot of the registry.
    pub fn devices(&self) -> Vec<Device> {
        self.registry.lock().unwrap().devices()
    }

    /// Direct arc power control for any address form, including groups
    /// and broadcast. Registry-tracked devices are better reached
    /// through [`Gear::set_level`].
    pub async fn send_level<A>(&self, addr: A, level: u8) -> Result<(), DaliSendResult>
    where
        A: Into<crate::common::address::AddressByte>,
    {
        send16::level(&self.handle, addr, level).await.check_send()
    }

    /// Subscribe to bus traffic originated by other controllers.
    pub fn add_message_callback(&self) -> (ListenerHandle, ReceiverStream<DaliBusEvent>) {
        let (handle, rx) = self.handle.add_listener();
        (handle, ReceiverStream::new(rx))
    }

    pub fn remove_message_callback(&self, handle: ListenerHandle) {
        self.handle.remove_listener(handle);
    }

    /// Shut the session down and close the transport.
    pub async fn close(mut self) {
        self.handle.close().await;
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// Capability handle for one device. Stateless apart from the unique
/// id; the current short address is resolved from the registry right
/// before every send.
#[derive(Clone)]
pub struct Gear {
    unique_id: UniqueId,
    handle: BusHandle,
    registry: Arc<Mutex<DeviceRegistry>>,
}

impl Gear {
    pub fn unique_id(&self) -> UniqueId {
        self.unique_id
    }

    fn short(&self) -> Result<Short, GearError> {
        self.registry
            .lock()
            .unwrap()
            .short_address(&self.unique_id)
            .ok_or(GearError::DeviceNotAddressed)
    }

    /// Return to the last active level. The ON command proper does not
    /// exist in 102; this is the conventional way to switch on.
    pub async fn on(&self) -> Result<(), GearError> {
        let addr = self.short()?;
        send16::cmd(&self.handle, cmd::GO_TO_LAST_ACTIVE_LEVEL(addr))
            .await
            .check_send()?;
        Ok(())
    }

    pub async fn off(&self) -> Result<(), GearError> {
        let addr = self.short()?;
        send16::cmd(&self.handle, cmd::OFF(addr)).await.check_send()?;
        Ok(())
    }

    /// Direct arc power control; 0 is off, 254 is full, MASK stops a
    /// running fade.
    pub async fn set_level(&self, level: u8) -> Result<(), GearError> {
        let addr = self.short()?;
        send16::level(&self.handle, addr, level)
            .await
            .check_send()?;
        Ok(())
    }

    pub async fn recall_max(&self) -> Result<(), GearError> {
        let addr = self.short()?;
        send16::cmd(&self.handle, cmd::RECALL_MAX_LEVEL(addr))
            .await
            .check_send()?;
        Ok(())
    }

    pub async fn recall_min(&self) -> Result<(), GearError> {
        let addr = self.short()?;
        send16::cmd(&self.handle, cmd::RECALL_MIN_LEVEL(addr))
            .await
            .check_send()?;
        Ok(())
    }

    pub async fn up(&self) -> Result<(), GearError> {
        let addr = self.short()?;
        send16::cmd(&self.handle, cmd::UP(addr)).await.check_send()?;
        Ok(())
    }

    pub async fn down(&self) -> Result<(), GearError> {
        let addr = self.short()?;
        send16::cmd(&self.handle, cmd::DOWN(addr)).await.check_send()?;
        Ok(())
    }

    pub async fn query_status(&self) -> Result<GearStatus, GearError> {
        let addr = self.short()?;
        let status = send16::query(&self.handle, cmd::QUERY_STATUS(addr))
            .await
            .check_answer()?;
        Ok(GearStatus::new(status))
    }

    pub async fn query_actual_level(&self) -> Result<u8, GearError> {
        let addr = self.short()?;
        Ok(send16::query(&self.handle, cmd::QUERY_ACTUAL_LEVEL(addr))
            .await
            .check_answer()?)
    }

    pub async fn query_groups(&self) -> Result<u16, GearError> {
        let addr = self.short()?;
        let low = send16::query(&self.handle, cmd::QUERY_GROUPS_0_7(addr))
            .await
            .check_answer()?;
        let high = send16::query(&self.handle, cmd::QUERY_GROUPS_8_15(addr))
            .await
            .check_answer()?;
        Ok(u16::from_be_bytes([high, low]))
    }
}
