//! RAM admission for in-flight piece buffers.
//!
//! Before a piece downloader starts, its buffer is charged against a byte
//! budget. Requests that do not fit wait in strict FIFO order: the head
//! blocks the queue, so a large request is never starved by smaller
//! latecomers. The broker is plain state owned by the controller loop;
//! grants are delivered on a notify channel the loop selects on.

use std::collections::VecDeque;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// The broker's view of one queued admission request.
struct Waiter {
    key: crate::peer::PeerId,
    amount: u64,
    notify: mpsc::Sender<crate::peer::PeerId>,
    cancel: oneshot::Receiver<()>,
}

impl Waiter {
    fn cancelled(&mut self) -> bool {
        // fired or dropped either way means the requester is gone
        !matches!(self.cancel.try_recv(), Err(oneshot::error::TryRecvError::Empty))
    }
}

/// Byte-budgeted admission with FIFO waiters and per-key cancellation.
pub struct RamBroker {
    budget: u64,
    allocated: u64,
    waiters: VecDeque<Waiter>,
}

impl RamBroker {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            allocated: 0,
            waiters: VecDeque::new(),
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Attempts to reserve `amount` bytes for `key` without blocking.
    ///
    /// Returns true when the reservation was made. Otherwise the request
    /// is queued; once it fits, `key` is sent on `notify`, at which point
    /// the reservation is already made on the caller's behalf. Dropping
    /// or firing `cancel` abandons the queued request.
    pub fn request(
        &mut self,
        key: crate::peer::PeerId,
        amount: u64,
        notify: &mpsc::Sender<crate::peer::PeerId>,
        cancel: oneshot::Receiver<()>,
    ) -> bool {
        if self.waiters.is_empty() && self.allocated + amount <= self.budget {
            self.allocated += amount;
            return true;
        }
        self.waiters.push_back(Waiter {
            key,
            amount,
            notify: notify.clone(),
            cancel,
        });
        false
    }

    /// Returns `amount` bytes to the budget and grants queued waiters
    /// head-first while they fit.
    pub fn release(&mut self, amount: u64) {
        debug_assert!(self.allocated >= amount, "release exceeds reservations");
        self.allocated = self.allocated.saturating_sub(amount);
        self.drain();
    }

    fn drain(&mut self) {
        while let Some(head) = self.waiters.front_mut() {
            if head.cancelled() {
                self.waiters.pop_front();
                continue;
            }
            if self.allocated + head.amount > self.budget {
                // head blocks the queue
                return;
            }
            let head = self.waiters.pop_front().expect("front exists");
            self.allocated += head.amount;
            match head.notify.try_send(head.key) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => {
                    // grantee is gone, take the reservation back
                    self.allocated -= head.amount;
                }
                Err(TrySendError::Full(_)) => {
                    warn!("ram notify channel full, dropping grant");
                    self.allocated -= head.amount;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;

    fn key(n: u8) -> PeerId {
        PeerId::from_bytes([n; 20])
    }

    #[test]
    fn admits_up_to_budget_then_queues() {
        let piece_len = 1024u64;
        let mut ram = RamBroker::new(2 * piece_len);
        let (notify, mut granted) = mpsc::channel(8);

        let (_c1, r1) = oneshot::channel();
        let (_c2, r2) = oneshot::channel();
        let (_c3, r3) = oneshot::channel();

        assert!(ram.request(key(1), piece_len, &notify, r1));
        assert!(ram.request(key(2), piece_len, &notify, r2));
        assert!(!ram.request(key(3), piece_len, &notify, r3));
        assert_eq!(ram.allocated(), 2 * piece_len);

        // first completion releases and the third peer's grant fires
        ram.release(piece_len);
        assert_eq!(granted.try_recv().unwrap(), key(3));
        assert_eq!(ram.allocated(), 2 * piece_len);
    }

    #[test]
    fn fifo_head_blocks_smaller_latecomers() {
        let mut ram = RamBroker::new(10);
        let (notify, mut granted) = mpsc::channel(8);

        let (_c1, r1) = oneshot::channel();
        let (_c2, r2) = oneshot::channel();
        let (_c3, r3) = oneshot::channel();

        assert!(ram.request(key(1), 8, &notify, r1));
        assert!(!ram.request(key(2), 6, &notify, r2)); // head
        assert!(!ram.request(key(3), 1, &notify, r3)); // would fit, must wait

        ram.release(2);
        assert!(granted.try_recv().is_err());

        ram.release(6);
        assert_eq!(granted.try_recv().unwrap(), key(2));
        assert_eq!(granted.try_recv().unwrap(), key(3));
        assert_eq!(ram.allocated(), 7);
    }

    #[test]
    fn cancelled_waiters_are_dropped_on_drain() {
        let mut ram = RamBroker::new(4);
        let (notify, mut granted) = mpsc::channel(8);

        let (_c1, r1) = oneshot::channel();
        let (c2, r2) = oneshot::channel::<()>();
        let (_c3, r3) = oneshot::channel();

        assert!(ram.request(key(1), 4, &notify, r1));
        assert!(!ram.request(key(2), 4, &notify, r2));
        assert!(!ram.request(key(3), 2, &notify, r3));

        drop(c2); // peer 2 disconnected
        ram.release(4);
        assert_eq!(granted.try_recv().unwrap(), key(3));
        assert_eq!(ram.allocated(), 2);
    }

    #[test]
    fn reservation_sum_never_exceeds_budget() {
        let mut ram = RamBroker::new(5);
        let (notify, _granted) = mpsc::channel(8);
        let mut cancels = Vec::new();
        for i in 0..10 {
            let (c, r) = oneshot::channel();
            cancels.push(c);
            ram.request(key(i), 2, &notify, r);
            assert!(ram.allocated() <= 5);
        }
        ram.release(2);
        assert!(ram.allocated() <= 5);
    }
}
