//! Half-duplex command dispatch for one bus.
//!
//! A spawned task owns the transport and is the only component that
//! touches it. Requests are serialized through a channel, so at most one
//! forward frame is in flight at any time; adapter packets that do not
//! belong to the pending request are fanned out to listeners.

use crate::drivers::driver::{DaliBusEvent, DaliBusEventType, DaliFrame, DaliSendResult};
use crate::drivers::send_flags::Flags;
use crate::drivers::transport::{ConnectionError, Transport};
use crate::drivers::tridonic::codec::{self, MessageSource, RxEvent, RxPacket};
use crate::utils::dyn_future::DynFuture;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

/// Minimum idle time between forward frames, also used as the gap
/// between the two transmissions of a send-twice command.
pub const SETTLE_TIME: Duration = Duration::from_micros(13500);

/// How long to wait for the adapter to report the outcome of a
/// transmission before giving up on it.
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(100);

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_POLL: Duration = Duration::from_millis(5);
const REQUEST_QUEUE_DEPTH: usize = 10;
const LISTENER_QUEUE_DEPTH: usize = 32;

/// Anything that can put a forward frame on the bus and report the
/// outcome. Implemented by [`BusHandle`] for ordinary traffic and by
/// [`ScanGuard`] for addressing sequences.
pub trait FrameSender: Send + Sync {
    fn send_frame(&self, frame: DaliFrame, flags: Flags) -> DynFuture<'_, DaliSendResult>;
}

struct DaliReq {
    frame: DaliFrame,
    flags: Flags,
    reply: oneshot::Sender<DaliSendResult>,
}

enum Request {
    Send(DaliReq),
    Shutdown,
}

struct Listener {
    id: usize,
    tx: mpsc::Sender<DaliBusEvent>,
}

type Listeners = Arc<Mutex<Vec<Listener>>>;

/// Registration receipt for a bus listener; pass back to
/// [`BusHandle::remove_listener`] to stop delivery.
#[derive(Debug)]
pub struct ListenerHandle {
    id: usize,
}

/// Cloneable client side of a bus dispatcher.
#[derive(Clone)]
pub struct BusHandle {
    send_req: mpsc::Sender<Request>,
    listeners: Listeners,
    next_listener_id: Arc<AtomicUsize>,
    scanning: Arc<AtomicBool>,
}

/// Start the dispatch task for `transport`. The task runs until
/// [`BusHandle::close`] or a fatal transport error.
pub fn start(transport: Box<dyn Transport>) -> (BusHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));
    let join = tokio::spawn(dispatch_thread(transport, rx, listeners.clone()));
    let handle = BusHandle {
        send_req: tx,
        listeners,
        next_listener_id: Arc::new(AtomicUsize::new(0)),
        scanning: Arc::new(AtomicBool::new(false)),
    };
    (handle, join)
}

impl BusHandle {
    async fn enqueue(&self, frame: DaliFrame, flags: Flags) -> DaliSendResult {
        let (tx, rx) = oneshot::channel();
        let req = DaliReq {
            frame,
            flags,
            reply: tx,
        };
        if self.send_req.send(Request::Send(req)).await.is_err() {
            return DaliSendResult::Connection(ConnectionError::Closed);
        }
        match rx.await {
            Ok(res) => res,
            Err(_) => DaliSendResult::Connection(ConnectionError::Closed),
        }
    }

    /// Lock the bus for an addressing sequence. While the guard lives,
    /// ordinary sends fail fast with `Busy`.
    pub fn lock_exclusive(&self) -> Result<ScanGuard, DaliSendResult> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DaliSendResult::Busy);
        }
        Ok(ScanGuard {
            handle: self.clone(),
        })
    }

    /// Register a listener for unsolicited bus traffic. Events are
    /// delivered through a bounded queue; a listener that does not keep
    /// up loses its own events and nothing else.
    pub fn add_listener(&self) -> (ListenerHandle, mpsc::Receiver<DaliBusEvent>) {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_DEPTH);
        self.listeners.lock().unwrap().push(Listener { id, tx });
        (ListenerHandle { id }, rx)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.listeners.lock().unwrap().retain(|l| l.id != handle.id);
    }

    /// Shut the dispatch task down and close the transport. Requests
    /// queued after this complete with a connection error.
    pub async fn close(&self) {
        let _ = self.send_req.send(Request::Shutdown).await;
    }
}

impl FrameSender for BusHandle {
    fn send_frame(&self, frame: DaliFrame, flags: Flags) -> DynFuture<'_, DaliSendResult> {
        Box::pin(async move {
            if self.scanning.load(Ordering::SeqCst) {
                return DaliSendResult::Busy;
            }
            self.enqueue(frame, flags).await
        })
    }
}

/// Exclusive access to the bus during addressing. Dropping the guard
/// reopens the bus for ordinary traffic.
pub struct ScanGuard {
    handle: BusHandle,
}

impl FrameSender for ScanGuard {
    fn send_frame(&self, frame: DaliFrame, flags: Flags) -> DynFuture<'_, DaliSendResult> {
        Box::pin(self.handle.enqueue(frame, flags))
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.handle.scanning.store(false, Ordering::SeqCst);
    }
}

fn next_sequence(seq: u8) -> u8 {
    // 0 marks traffic the adapter did not originate
    if seq == u8::MAX {
        1
    } else {
        seq + 1
    }
}

async fn dispatch_thread(
    mut transport: Box<dyn Transport>,
    mut recv: mpsc::Receiver<Request>,
    listeners: Listeners,
) {
    let mut sequence = 0u8;
    loop {
        match timeout(POLL_INTERVAL, recv.recv()).await {
            Ok(Some(Request::Send(req))) => {
                sequence = next_sequence(sequence);
                let res = process_request(
                    transport.as_mut(),
                    &listeners,
                    sequence,
                    &req.frame,
                    req.flags,
                )
                .await;
                let fatal = matches!(res, DaliSendResult::Connection(_));
                let _ = req.reply.send(res);
                if fatal {
                    break;
                }
                sleep(SETTLE_TIME).await;
            }
            Ok(Some(Request::Shutdown)) | Ok(None) => break,
            Err(_) => {
                // Idle; service the adapter so snooped traffic is not
                // left in its buffers.
                match transport.read_timeout(READ_POLL).await {
                    Ok(Some(data)) => fan_out(&listeners, &data),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Transport failed while idle: {}", e);
                        break;
                    }
                }
            }
        }
    }
    if let Err(e) = transport.close().await {
        debug!("Transport close failed: {}", e);
    }
    debug!("Dispatcher exited");
}

async fn process_request(
    transport: &mut dyn Transport,
    listeners: &Listeners,
    sequence: u8,
    frame: &DaliFrame,
    flags: Flags,
) -> DaliSendResult {
    let packet = codec::encode_send(sequence, frame);
    if let Err(e) = transport.write(&packet).await {
        return DaliSendResult::Connection(e);
    }
    if flags.send_twice() {
        // The retransmission must land inside the window the gear
        // accepts; one settle time keeps it well within.
        sleep(SETTLE_TIME).await;
        if let Err(e) = transport.write(&packet).await {
            return DaliSendResult::Connection(e);
        }
    }

    let no_answer_result = || {
        if flags.expect_answer() {
            DaliSendResult::Timeout
        } else {
            DaliSendResult::Ok
        }
    };
    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return no_answer_result();
        }
        let data = match transport.read_timeout(left).await {
            Ok(Some(data)) => data,
            Ok(None) => return no_answer_result(),
            Err(e) => return DaliSendResult::Connection(e),
        };
        let pkt = match codec::decode_recv(&data) {
            Ok(pkt) => pkt,
            Err(e) => return DaliSendResult::DriverError(Box::new(e)),
        };
        if pkt.source == MessageSource::Master && pkt.sequence == sequence {
            match pkt.event {
                RxEvent::Answer(v) => return DaliSendResult::Answer(v),
                RxEvent::NoReply => return no_answer_result(),
                RxEvent::FramingError => return DaliSendResult::Framing,
                RxEvent::TxComplete => {
                    if !flags.expect_answer() {
                        return DaliSendResult::Ok;
                    }
                    // Answer still outstanding, keep waiting.
                }
                RxEvent::Frame(_) => {
                    // Echo of our own forward frame.
                }
            }
        } else {
            deliver(listeners, &pkt);
        }
    }
}

fn fan_out(listeners: &Listeners, data: &[u8]) {
    match codec::decode_recv(data) {
        Ok(pkt) => deliver(listeners, &pkt),
        Err(e) => warn!("Dropping packet: {}", e),
    }
}

/// Turn an uncorrelated adapter packet into a listener event.
/// Adapter bookkeeping for our own traffic is not bus activity and is
/// filtered here.
fn unsolicited_event(pkt: &RxPacket) -> Option<DaliBusEventType> {
    match (&pkt.source, &pkt.event) {
        (MessageSource::External, RxEvent::Frame(DaliFrame::Frame16(b))) => {
            Some(DaliBusEventType::Frame16(*b))
        }
        (MessageSource::External, RxEvent::Frame(DaliFrame::Frame24(b))) => {
            Some(DaliBusEventType::Frame24(*b))
        }
        (_, RxEvent::Answer(v)) => Some(DaliBusEventType::Frame8(*v)),
        (MessageSource::External, RxEvent::FramingError) => Some(DaliBusEventType::FramingError),
        _ => None,
    }
}

fn deliver(listeners: &Listeners, pkt: &RxPacket) {
    let Some(event_type) = unsolicited_event(pkt) else {
        return;
    };
    let event = DaliBusEvent {
        timestamp: std::time::Instant::now(),
        event_type,
    };
    let listeners = listeners.lock().unwrap();
    for listener in listeners.iter() {
        match listener.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Listener {} backlogged, event dropped", listener.id)
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
