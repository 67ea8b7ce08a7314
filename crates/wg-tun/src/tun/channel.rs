//! In-memory loopback TUN for engines under test.

use crossbeam_channel::{Receiver, Sender, bounded, select};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{EVENT_QUEUE_CAPACITY, Tun, TunError, TunEvent};

/// Packets queued per direction before `write` blocks.
const PACKET_QUEUE_CAPACITY: usize = 256;

/// One end of an in-memory TUN pair.
///
/// Whatever one end writes, the other end reads. Closing an end wakes its
/// blocked reads and writes; the peer then sees `Closed` once its queue
/// drains.
pub struct ChannelTun {
    name: String,
    mtu: AtomicU32,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    // Dropping the sender disconnects `done_rx`, which wakes every select.
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    events_tx: Mutex<Option<Sender<TunEvent>>>,
    events_rx: Receiver<TunEvent>,
    errors_rx: Receiver<TunError>,
    // Held so the error queue stays connected for the device's lifetime.
    _errors_tx: Sender<TunError>,
    closed: AtomicBool,
}

impl ChannelTun {
    /// Create two connected ends sharing `name` and `mtu`.
    pub fn pair(name: &str, mtu: u32) -> (ChannelTun, ChannelTun) {
        let (a_tx, b_rx) = bounded(PACKET_QUEUE_CAPACITY);
        let (b_tx, a_rx) = bounded(PACKET_QUEUE_CAPACITY);
        (Self::new(name, mtu, a_tx, a_rx), Self::new(name, mtu, b_tx, b_rx))
    }

    fn new(name: &str, mtu: u32, tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        let (done_tx, done_rx) = bounded(0);
        let (events_tx, events_rx) = bounded(EVENT_QUEUE_CAPACITY);
        let (errors_tx, errors_rx) = bounded(EVENT_QUEUE_CAPACITY);
        let _ = events_tx.try_send(TunEvent::Up);

        Self {
            name: name.to_owned(),
            mtu: AtomicU32::new(mtu),
            tx,
            rx,
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            events_tx: Mutex::new(Some(events_tx)),
            events_rx,
            errors_rx,
            _errors_tx: errors_tx,
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_mtu(&self, mtu: u32) {
        if self.mtu.swap(mtu, Ordering::SeqCst) != mtu {
            let guard = self.events_tx.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(tx) = guard.as_ref() {
                let _ = tx.try_send(TunEvent::MtuUpdate(mtu));
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Tun for ChannelTun {
    fn read(&self, buf: &mut [u8]) -> Result<usize, TunError> {
        if self.is_closed() {
            return Err(TunError::Closed);
        }

        select! {
            recv(self.rx) -> packet => {
                let packet = packet.map_err(|_| TunError::Closed)?;
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            recv(self.done_rx) -> _ => Err(TunError::Closed),
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, TunError> {
        if self.is_closed() {
            return Err(TunError::Closed);
        }

        select! {
            send(self.tx, buf.to_vec()) -> sent => {
                sent.map_err(|_| TunError::Closed)?;
                Ok(buf.len())
            }
            recv(self.done_rx) -> _ => Err(TunError::Closed),
        }
    }

    fn name(&self) -> Result<String, TunError> {
        Ok(self.name.clone())
    }

    fn mtu(&self) -> Result<u32, TunError> {
        Ok(self.mtu.load(Ordering::SeqCst))
    }

    fn events(&self) -> Receiver<TunEvent> {
        self.events_rx.clone()
    }

    fn errors(&self) -> Receiver<TunError> {
        self.errors_rx.clone()
    }

    fn close(&self) -> Result<(), TunError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(tx) = self
            .events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.try_send(TunEvent::Down);
        }
        self.done_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}
