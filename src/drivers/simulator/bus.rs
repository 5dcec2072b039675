//! A bus full of simulated gear behind the adapter packet framing, so
//! the codec, dispatcher and scanning engine run unmodified against it.

use super::gear::SimGear;
use crate::drivers::driver::{DaliFrame, DriverInfo, OpenError};
use crate::drivers::transport::{ConnectionError, Transport};
use crate::drivers::tridonic::codec::{self, MessageSource, RxEvent};
use crate::utils::dyn_future::DynFuture;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

const EVENT_QUEUE_DEPTH: usize = 256;

/// One write the master performed, for assertions on traffic and timing.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub at: Instant,
    pub frame: DaliFrame,
}

struct SimState {
    gears: Vec<SimGear>,
    writes: Vec<WriteRecord>,
    events: mpsc::Sender<Vec<u8>>,
}

/// Transport end of the simulated bus; hand it to the dispatcher.
pub struct SimBus {
    state: Arc<Mutex<SimState>>,
    recv: mpsc::Receiver<Vec<u8>>,
    closed: bool,
}

/// Test-side handle: populate the bus, inject foreign traffic, inspect
/// what the master sent.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

pub fn sim_bus() -> (SimBus, SimHandle) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let state = Arc::new(Mutex::new(SimState {
        gears: Vec::new(),
        writes: Vec::new(),
        events: tx,
    }));
    (
        SimBus {
            state: state.clone(),
            recv: rx,
            closed: false,
        },
        SimHandle { state },
    )
}

impl SimHandle {
    pub fn add_gear(&self, gear: SimGear) {
        self.state.lock().unwrap().gears.push(gear);
    }

    /// Run `f` on the simulated gear, for assertions on device state.
    pub fn with_gears<R>(&self, f: impl FnOnce(&mut Vec<SimGear>) -> R) -> R {
        f(&mut self.state.lock().unwrap().gears)
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    /// Put a forward frame on the bus as if another controller sent it.
    pub fn inject_frame16(&self, frame: [u8; 2]) {
        let state = self.state.lock().unwrap();
        // The other controller's frame also reaches the simulated gear.
        // Its answer is not modelled; snooping masters only see traffic.
        let packet = codec::encode_recv(
            MessageSource::External,
            0,
            &RxEvent::Frame(DaliFrame::Frame16(frame)),
        );
        let _ = state.events.try_send(packet.to_vec());
    }
}

impl SimState {
    fn process_write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let (sequence, frame) = codec::decode_send(data)
            .map_err(|e| ConnectionError::Device(e.to_string()))?;
        self.writes.push(WriteRecord {
            at: Instant::now(),
            frame: frame.clone(),
        });
        let answers: Vec<u8> = match &frame {
            DaliFrame::Frame16(bytes) => self
                .gears
                .iter_mut()
                .filter_map(|g| g.receive_frame16(*bytes))
                .collect(),
            // no simulated 103 devices; 24-bit frames go unanswered
            DaliFrame::Frame24(_) => Vec::new(),
        };
        let event = match answers.len() {
            0 => RxEvent::NoReply,
            1 => RxEvent::Answer(answers[0]),
            _ => {
                debug!("{} devices answered at once", answers.len());
                RxEvent::FramingError
            }
        };
        let packet = codec::encode_recv(MessageSource::Master, sequence, &event);
        let _ = self.events.try_send(packet.to_vec());
        Ok(())
    }
}

impl Transport for SimBus {
    fn write(&mut self, data: &[u8]) -> DynFuture<'_, Result<(), ConnectionError>> {
        let res = if self.closed {
            Err(ConnectionError::Closed)
        } else {
            self.state.lock().unwrap().process_write(data)
        };
        Box::pin(std::future::ready(res))
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
        Box::pin(std::future::ready(Ok(())))
    }
}

fn driver_open(params: HashMap<String, String>) -> Result<Box<dyn Transport>, OpenError> {
    let gears = match params.get("gears") {
        None => 0,
        Some(s) => s
            .parse::<u64>()
            .map_err(|_| OpenError::ParameterError("gears must be a number".to_string()))?,
    };
    let (bus, handle) = sim_bus();
    for n in 0..gears {
        handle.add_gear(SimGear::new(0x0100_0000_0000 + n, n + 1));
    }
    Ok(Box::new(bus))
}

pub fn driver_info() -> DriverInfo {
    DriverInfo {
        name: "sim".to_string(),
        description: "Simulated bus, add gears=N for test devices".to_string(),
        open: driver_open,
    }
}
