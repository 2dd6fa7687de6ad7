use std::collections::VecDeque;
use tokio::sync::mpsc;
use crate::ID;

// Grants are delivered as the waiter's key on the controller's notify
// channel.
pub type GrantTx = mpsc::UnboundedSender<ID>;
pub type GrantRx = mpsc::UnboundedReceiver<ID>;

// Bounds the total bytes held by in-flight piece buffers. Owned by the
// controller; every call runs inside its loop, so there is no locking.
// Waiters are strictly FIFO and the head blocks the queue, which keeps a
// large request from starving behind a stream of small latecomers.
#[derive(Debug)]
pub struct RamBroker {

    budget: usize,

    allocated: usize,

    waiters: VecDeque<Waiter>,

}

#[derive(Debug)]
struct Waiter {
    key: ID,
    amount: usize,
    notify: GrantTx,
}

impl RamBroker {

    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            allocated: 0,
            waiters: VecDeque::new(),
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    // Non-blocking admission. Returns true and reserves when the amount
    // fits; otherwise the request joins the queue and the grant arrives on
    // notify once capacity frees up. Queued requests are never bypassed,
    // even by one that would fit right now.
    pub fn request(&mut self, key: ID, amount: usize, notify: GrantTx) -> bool {
        if self.waiters.is_empty() && self.allocated + amount <= self.budget {
            self.allocated += amount;
            return true;
        }
        self.waiters.push_back(Waiter { key, amount, notify });
        false
    }

    pub fn release(&mut self, amount: usize) {
        debug_assert!(amount <= self.allocated);
        self.allocated = self.allocated.saturating_sub(amount);
        self.drain();
    }

    // Drops every queued request for the key, e.g. when its peer
    // disconnects. Removing the head can unblock the rest of the queue.
    pub fn cancel(&mut self, key: &ID) {
        self.waiters.retain(|w| w.key != *key);
        self.drain();
    }

    fn drain(&mut self) {
        while let Some(head) = self.waiters.front() {
            if self.allocated + head.amount > self.budget {
                break;
            }
            let head = self.waiters.pop_front().unwrap();
            // A dropped receiver counts as a cancelled waiter.
            if head.notify.send(head.key).is_ok() {
                self.allocated += head.amount;
            }
        }
    }
}
