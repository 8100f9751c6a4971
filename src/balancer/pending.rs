//! Intrusive FIFO queue of outstanding `SendAndReceive` requests for one
//! device session.
//!
//! The original implementation links [`PendingCommandNode`] objects directly
//! into a doubly-linked list so a node can be unlinked from wherever it sits
//! in O(1) — not just from the front — once its `asyncio.wait_for` resolves
//! or times out. Rust has no convenient way to hold that kind of
//! self-referential node graph safely, so this ports the same shape onto a
//! slab: each node lives at a stable index, linked by `prev`/`next` indices,
//! and a generation counter on each slot catches a caller that holds a
//! [`NodeHandle`] for a node that has already been popped and the slot
//! reused.

use tokio::sync::oneshot;

/// What a `SendAndReceive` call eventually receives: the device's reply
/// frame, or the reason the wait ended without one.
pub type Responder = oneshot::Sender<Result<String, String>>;

struct Node {
    responder: Responder,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Slot {
    node: Option<Node>,
    generation: u64,
}

/// An opaque reference to a node previously pushed onto a [`PendingList`].
/// Valid only against the list it was returned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle {
    index: usize,
    generation: u64,
}

/// The per-device FIFO of requests awaiting a reply.
#[derive(Default)]
pub struct PendingList {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl PendingList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Link a new node at the tail, returning a handle the caller can later
    /// [`remove`](Self::remove) if the wait is abandoned before a reply
    /// arrives.
    pub fn push_back(&mut self, responder: Responder) -> NodeHandle {
        let node = Node { responder, prev: self.tail, next: None };

        let (index, generation) = match self.free.pop() {
            Some(index) => {
                self.slots[index].node = Some(node);
                (index, self.slots[index].generation)
            }
            None => {
                self.slots.push(Slot { node: Some(node), generation: 0 });
                (self.slots.len() - 1, 0)
            }
        };

        if let Some(tail) = self.tail {
            self.slots[tail].node.as_mut().expect("tail must be linked").next = Some(index);
        } else {
            self.head = Some(index);
        }
        self.tail = Some(index);
        self.len += 1;

        NodeHandle { index, generation }
    }

    /// Pop and unlink the head of the queue, if any — used when a device
    /// reply arrives and must be paired with the oldest outstanding request.
    pub fn pop_front(&mut self) -> Option<Responder> {
        let index = self.head?;
        let node = self.slots[index].node.take().expect("head must be linked");

        self.head = node.next;
        match self.head {
            Some(next) => self.slots[next].node.as_mut().expect("linked").prev = None,
            None => self.tail = None,
        }

        self.slots[index].generation += 1;
        self.free.push(index);
        self.len -= 1;

        Some(node.responder)
    }

    /// Unlink a specific node, wherever it sits in the list. Returns `None`
    /// if the handle is stale (the node was already popped or removed).
    pub fn remove(&mut self, handle: NodeHandle) -> Option<Responder> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        let node = slot.node.take()?;

        match node.prev {
            Some(prev) => self.slots[prev].node.as_mut().expect("linked").next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.slots[next].node.as_mut().expect("linked").prev = node.prev,
            None => self.tail = node.prev,
        }

        self.slots[handle.index].generation += 1;
        self.free.push(handle.index);
        self.len -= 1;

        Some(node.responder)
    }

    /// Pop every outstanding node, in FIFO order — used when a device
    /// connection is torn down and every waiter must be told the connection
    /// was lost.
    pub fn drain(&mut self) -> Vec<Responder> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(r) = self.pop_front() {
            out.push(r);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder() -> (Responder, oneshot::Receiver<Result<String, String>>) {
        oneshot::channel()
    }

    #[test]
    fn fifo_pop_order() {
        let mut list = PendingList::new();
        let (tx1, rx1) = responder();
        let (tx2, rx2) = responder();
        list.push_back(tx1);
        list.push_back(tx2);

        list.pop_front().unwrap().send(Ok("first".into())).unwrap();
        list.pop_front().unwrap().send(Ok("second".into())).unwrap();

        assert_eq!(rx1.blocking_recv().unwrap().unwrap(), "first");
        assert_eq!(rx2.blocking_recv().unwrap().unwrap(), "second");
        assert!(list.is_empty());
    }

    #[test]
    fn remove_from_middle_leaves_fifo_order_for_the_rest() {
        let mut list = PendingList::new();
        let (tx1, _rx1) = responder();
        let (tx2, rx2) = responder();
        let (tx3, rx3) = responder();
        list.push_back(tx1);
        let handle2 = list.push_back(tx2);
        list.push_back(tx3);

        let removed = list.remove(handle2).unwrap();
        drop(removed);

        assert_eq!(list.len(), 2);
        list.pop_front().unwrap().send(Ok("one".into())).unwrap();
        list.pop_front().unwrap().send(Ok("three".into())).unwrap();
        assert!(rx2.blocking_recv().is_err());
        assert_eq!(rx3.blocking_recv().unwrap().unwrap(), "three");
    }

    #[test]
    fn stale_handle_after_pop_is_a_no_op() {
        let mut list = PendingList::new();
        let (tx, _rx) = responder();
        let handle = list.push_back(tx);
        assert!(list.pop_front().is_some());
        assert!(list.remove(handle).is_none());
    }

    #[test]
    fn recycled_slot_does_not_answer_to_old_handle() {
        let mut list = PendingList::new();
        let (tx1, _rx1) = responder();
        let handle1 = list.push_back(tx1);
        list.pop_front();

        let (tx2, _rx2) = responder();
        let handle2 = list.push_back(tx2);
        assert_eq!(handle1.index, handle2.index);
        assert_ne!(handle1.generation, handle2.generation);
        assert!(list.remove(handle1).is_none());
        assert!(list.remove(handle2).is_some());
    }

    #[test]
    fn drain_rejects_every_waiter_in_order() {
        let mut list = PendingList::new();
        let (tx1, rx1) = responder();
        let (tx2, rx2) = responder();
        list.push_back(tx1);
        list.push_back(tx2);

        for r in list.drain() {
            let _ = r.send(Err("Connection to the device was lost.".to_string()));
        }

        assert_eq!(rx1.blocking_recv().unwrap().unwrap_err(), "Connection to the device was lost.");
        assert_eq!(rx2.blocking_recv().unwrap().unwrap_err(), "Connection to the device was lost.");
    }
}
