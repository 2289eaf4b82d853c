//! In-process [`BusChannel`] for desktop builds and tests.
//!
//! [`link`] returns the two ends of one bidirectional link. Packets written
//! with `write_async` are staged locally and only become visible to the
//! other end on `pump_send`, like a real DMA-driven bus. An endpoint may own
//! a service hook that `pump_send` and `request_blocking` call to let the
//! cores on the other side make progress, so a single thread can drive the
//! whole pipeline.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use picocom_hal::BusChannel;
use thiserror::Error;

use crate::protocol::bus::BusCmd;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopbackError {
    #[error("packet of {len} bytes does not fit a {capacity} byte buffer")]
    PacketTooLarge { len: usize, capacity: usize },
    #[error("request timed out after {0} ms")]
    Timeout(u32),
    #[error("packet type cannot be sent as a blocking request")]
    NotARequest,
}

type Queue = Rc<RefCell<VecDeque<Vec<u8>>>>;

/// Runs the far side of a link.
pub type Service = Rc<RefCell<dyn FnMut()>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
}

pub struct LoopbackEndpoint {
    tx: Queue,
    rx: Queue,
    staged: VecDeque<Vec<u8>>,
    service: Option<Service>,
    stats: LinkStats,
}

/// Create both ends of a link.
pub fn link() -> (LoopbackEndpoint, LoopbackEndpoint) {
    let a_to_b: Queue = Rc::default();
    let b_to_a: Queue = Rc::default();
    (
        LoopbackEndpoint::new(a_to_b.clone(), b_to_a.clone()),
        LoopbackEndpoint::new(b_to_a, a_to_b),
    )
}

impl LoopbackEndpoint {
    fn new(tx: Queue, rx: Queue) -> Self {
        Self {
            tx,
            rx,
            staged: VecDeque::new(),
            service: None,
            stats: LinkStats::default(),
        }
    }

    pub fn set_service(&mut self, service: Service) {
        self.service = Some(service);
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Packets waiting to be received on this end.
    pub fn inbound(&self) -> usize {
        self.rx.borrow().len()
    }

    /// Packets written but not yet pumped.
    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    fn run_service(&self) {
        if let Some(service) = &self.service {
            // Skip when re-entered from inside the service itself.
            if let Ok(mut f) = service.try_borrow_mut() {
                (&mut *f)();
            }
        }
    }

    fn flush_staged(&mut self) {
        let mut tx = self.tx.borrow_mut();
        while let Some(packet) = self.staged.pop_front() {
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += packet.len() as u64;
            tx.push_back(packet);
        }
    }

    fn take_matching(&mut self, cmd: BusCmd) -> Option<Vec<u8>> {
        let mut rx = self.rx.borrow_mut();
        let pos = rx.iter().position(|p| p.first() == Some(&(cmd as u8)))?;
        rx.remove(pos)
    }
}

impl BusChannel for LoopbackEndpoint {
    type Error = LoopbackError;

    fn pump_send(&mut self) -> Result<(), LoopbackError> {
        self.flush_staged();
        self.run_service();
        Ok(())
    }

    fn pump_receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, LoopbackError> {
        let Some(packet) = self.rx.borrow_mut().pop_front() else {
            return Ok(None);
        };
        if packet.len() > buf.len() {
            return Err(LoopbackError::PacketTooLarge {
                len: packet.len(),
                capacity: buf.len(),
            });
        }
        buf[..packet.len()].copy_from_slice(&packet);
        self.stats.packets_received += 1;
        Ok(Some(packet.len()))
    }

    fn write_async(&mut self, packet: &[u8]) -> Result<(), LoopbackError> {
        self.staged.push_back(packet.to_vec());
        Ok(())
    }

    fn request_blocking(
        &mut self,
        request: &[u8],
        response: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, LoopbackError> {
        let reply = BusCmd::of(request)
            .ok()
            .and_then(BusCmd::reply)
            .ok_or(LoopbackError::NotARequest)?;
        self.staged.push_back(request.to_vec());
        self.flush_staged();

        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            if let Some(packet) = self.take_matching(reply) {
                if packet.len() > response.len() {
                    return Err(LoopbackError::PacketTooLarge {
                        len: packet.len(),
                        capacity: response.len(),
                    });
                }
                response[..packet.len()].copy_from_slice(&packet);
                self.stats.packets_received += 1;
                return Ok(packet.len());
            }
            if Instant::now() >= deadline {
                return Err(LoopbackError::Timeout(timeout_ms));
            }
            self.run_service();
        }
    }
}
