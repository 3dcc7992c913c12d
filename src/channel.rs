//! Typed channel for communication across fibers.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use num_enum::{IntoPrimitive, UnsafeFromPrimitive};
use static_assertions::assert_impl_all;

use crate::error::{RecvError, SendError, TryRecvError, TrySendError};
use crate::fiber::{self, Fiber};
use crate::lock::Lock;
use crate::select::SelectContext;

/// Outcome published to a parked waiter before its fiber is restored.
#[repr(u8)]
#[derive(Copy, Clone, IntoPrimitive, UnsafeFromPrimitive)]
enum DeliveryState {
    Pending = 0,
    Delivered = 1,
    Closed = 2,
}

pub(crate) struct SenderWaiter<T> {
    fiber: Fiber,
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
    select: Option<Arc<SelectContext>>,
}

// SAFETY: `value` is mutated only under the owning channel's lock; the parked
// fiber reads it back only after observing the delivery state store.
unsafe impl<T: Send> Send for SenderWaiter<T> {}
unsafe impl<T: Send> Sync for SenderWaiter<T> {}

impl<T: Send> SenderWaiter<T> {
    fn new(value: T, select: Option<Arc<SelectContext>>) -> Arc<SenderWaiter<T>> {
        Arc::new(SenderWaiter {
            fiber: fiber::current(),
            state: AtomicU8::new(DeliveryState::Pending.into()),
            value: UnsafeCell::new(Some(value)),
            select,
        })
    }

    fn state(&self) -> DeliveryState {
        // SAFETY: the atomic only ever holds DeliveryState discriminants.
        unsafe { DeliveryState::from_unchecked(self.state.load(Ordering::Acquire)) }
    }

    // Takes the pending value and restores the sender. Channel lock held.
    fn complete(&self) -> T {
        let value = unsafe { &mut *self.value.get() }.take();
        self.state.store(DeliveryState::Delivered.into(), Ordering::Release);
        self.fiber.restore();
        match value {
            Some(value) => value,
            None => unreachable!("sender waiter completed twice"),
        }
    }

    fn close(&self) {
        self.state.store(DeliveryState::Closed.into(), Ordering::Release);
        self.fiber.restore();
    }

    // Reads the outcome after wakeup. Fails with the value handed back if the
    // channel closed before anyone took it.
    pub(crate) fn finish(&self) -> Result<(), SendError<T>> {
        match self.state() {
            DeliveryState::Delivered => Ok(()),
            DeliveryState::Closed => {
                let value = unsafe { &mut *self.value.get() }.take();
                match value {
                    Some(value) => Err(SendError::Closed(value)),
                    None => unreachable!("closed sender waiter lost its value"),
                }
            },
            DeliveryState::Pending => unreachable!("sender woken without delivery state set"),
        }
    }
}

pub(crate) struct ReceiverWaiter<T> {
    fiber: Fiber,
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
    select: Option<Arc<SelectContext>>,
}

// SAFETY: same discipline as SenderWaiter.
unsafe impl<T: Send> Send for ReceiverWaiter<T> {}
unsafe impl<T: Send> Sync for ReceiverWaiter<T> {}

impl<T: Send> ReceiverWaiter<T> {
    fn new(select: Option<Arc<SelectContext>>) -> Arc<ReceiverWaiter<T>> {
        Arc::new(ReceiverWaiter {
            fiber: fiber::current(),
            state: AtomicU8::new(DeliveryState::Pending.into()),
            value: UnsafeCell::new(None),
            select,
        })
    }

    fn state(&self) -> DeliveryState {
        // SAFETY: the atomic only ever holds DeliveryState discriminants.
        unsafe { DeliveryState::from_unchecked(self.state.load(Ordering::Acquire)) }
    }

    // Deposits a value and restores the receiver. Channel lock held.
    fn deliver(&self, value: T) {
        unsafe { *self.value.get() = Some(value) };
        self.state.store(DeliveryState::Delivered.into(), Ordering::Release);
        self.fiber.restore();
    }

    fn close(&self) {
        self.state.store(DeliveryState::Closed.into(), Ordering::Release);
        self.fiber.restore();
    }

    // Reads the outcome after wakeup.
    pub(crate) fn finish(&self) -> Result<T, RecvError> {
        match self.state() {
            DeliveryState::Delivered => {
                let value = unsafe { &mut *self.value.get() }.take();
                match value {
                    Some(value) => Ok(value),
                    None => unreachable!("delivered receiver waiter lost its value"),
                }
            },
            DeliveryState::Closed => Err(RecvError::Closed),
            DeliveryState::Pending => unreachable!("receiver woken without delivery state set"),
        }
    }
}

struct State<T> {
    capacity: usize,
    closed: bool,
    buffer: VecDeque<T>,
    senders: VecDeque<Arc<SenderWaiter<T>>>,
    receivers: VecDeque<Arc<ReceiverWaiter<T>>>,
}

impl<T: Send> State<T> {
    fn new(capacity: usize) -> Self {
        State {
            capacity,
            closed: false,
            buffer: VecDeque::with_capacity(capacity),
            senders: VecDeque::new(),
            receivers: VecDeque::new(),
        }
    }

    // Pops the first receiver that is still winnable: either a plain waiter or
    // one whose select transitions to done here. Losers are stale entries left
    // by selects that already completed elsewhere; drop them.
    fn dequeue_receiver(&mut self) -> Option<Arc<ReceiverWaiter<T>>> {
        while let Some(waiter) = self.receivers.pop_front() {
            match &waiter.select {
                Some(context) if !context.try_trigger() => continue,
                _ => return Some(waiter),
            }
        }
        None
    }

    fn dequeue_sender(&mut self) -> Option<Arc<SenderWaiter<T>>> {
        while let Some(waiter) = self.senders.pop_front() {
            match &waiter.select {
                Some(context) if !context.try_trigger() => continue,
                _ => return Some(waiter),
            }
        }
        None
    }

    // Nonblocking half of send. Hands the value back if it would block.
    fn deliver(&mut self, value: T) -> Result<(), T> {
        if let Some(receiver) = self.dequeue_receiver() {
            receiver.deliver(value);
            Ok(())
        } else if self.buffer.len() < self.capacity {
            self.buffer.push_back(value);
            Ok(())
        } else {
            Err(value)
        }
    }

    // Nonblocking half of receive. Buffered values stay FIFO: a waiting
    // sender's value goes to the buffer tail, not to the caller.
    fn take(&mut self) -> Option<T> {
        if let Some(value) = self.buffer.pop_front() {
            if let Some(sender) = self.dequeue_sender() {
                self.buffer.push_back(sender.complete());
            }
            debug_assert!(self.buffer.len() <= self.capacity);
            Some(value)
        } else {
            self.dequeue_sender().map(|sender| sender.complete())
        }
    }
}

struct Inner<T> {
    lock: Lock,
    state: UnsafeCell<State<T>>,
}

// SAFETY: `state` is read and mutated only while `lock` is held.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

/// Typed communication channel between fibers.
///
/// A channel with capacity 0 transfers every value by rendezvous: a send
/// completes only when a receive takes the value directly, and vice versa.
/// With a positive capacity up to that many values are buffered before
/// senders block. Clones share the same underlying channel.
pub struct Channel<T: Send> {
    inner: Arc<Inner<T>>,
}

assert_impl_all!(Channel<()>: Send, Sync, Clone);

impl<T: Send> Channel<T> {
    /// Constructs a channel. Capacity 0 means rendezvous only.
    pub fn new(capacity: usize) -> Channel<T> {
        Channel { inner: Arc::new(Inner { lock: Lock::new(), state: UnsafeCell::new(State::new(capacity)) }) }
    }

    /// Sends a value, blocking the calling fiber while the channel is full.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.inner.lock.lock();
        // SAFETY: lock held.
        let state = unsafe { &mut *self.inner.state.get() };
        if state.closed {
            self.inner.lock.unlock();
            return Err(SendError::Closed(value));
        }
        match state.deliver(value) {
            Ok(()) => {
                self.inner.lock.unlock();
                Ok(())
            },
            Err(value) => {
                let waiter = SenderWaiter::new(value, None);
                state.senders.push_back(waiter.clone());
                self.inner.lock.unlock();
                fiber::reschedule();
                waiter.finish()
            },
        }
    }

    /// Attempts to send a value without blocking the calling fiber.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.inner.lock.lock();
        // SAFETY: lock held.
        let state = unsafe { &mut *self.inner.state.get() };
        let result = if state.closed {
            Err(TrySendError::Closed(value))
        } else {
            state.deliver(value).map_err(TrySendError::Full)
        };
        self.inner.lock.unlock();
        result
    }

    /// Receives a value, blocking the calling fiber while the channel is
    /// empty. Values buffered before a close are still delivered; only after
    /// the buffer drains does a closed channel fail.
    pub fn recv(&self) -> Result<T, RecvError> {
        self.inner.lock.lock();
        // SAFETY: lock held.
        let state = unsafe { &mut *self.inner.state.get() };
        if let Some(value) = state.take() {
            self.inner.lock.unlock();
            return Ok(value);
        }
        if state.closed {
            self.inner.lock.unlock();
            return Err(RecvError::Closed);
        }
        let waiter = ReceiverWaiter::new(None);
        state.receivers.push_back(waiter.clone());
        self.inner.lock.unlock();
        fiber::reschedule();
        waiter.finish()
    }

    /// Like [recv][Channel::recv], reporting closure as [None].
    pub fn recv_opt(&self) -> Option<T> {
        self.recv().ok()
    }

    /// Attempts to receive a value without blocking the calling fiber.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.inner.lock.lock();
        // SAFETY: lock held.
        let state = unsafe { &mut *self.inner.state.get() };
        let result = match state.take() {
            Some(value) => Ok(value),
            None if state.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        };
        self.inner.lock.unlock();
        result
    }

    /// Closes the channel. Idempotent.
    ///
    /// Every parked sender and receiver is woken with the closed outcome.
    /// Buffered values are not discarded; receivers drain them first.
    pub fn close(&self) {
        self.inner.lock.lock();
        // SAFETY: lock held.
        let state = unsafe { &mut *self.inner.state.get() };
        if state.closed {
            self.inner.lock.unlock();
            return;
        }
        state.closed = true;
        let senders = mem::take(&mut state.senders);
        let receivers = mem::take(&mut state.receivers);
        self.inner.lock.unlock();
        // Wake drained waiters outside the lock. A waiter whose select was
        // already won elsewhere must not be restored a second time.
        for sender in senders {
            match &sender.select {
                Some(context) if !context.try_trigger() => {},
                _ => sender.close(),
            }
        }
        for receiver in receivers {
            match &receiver.select {
                Some(context) if !context.try_trigger() => {},
                _ => receiver.close(),
            }
        }
    }

    /// Returns true if the channel has been closed.
    pub fn is_closed(&self) -> bool {
        // SAFETY: lock held for the duration of the read.
        self.inner.lock.sync(|| unsafe { &*self.inner.state.get() }.closed)
    }

    /// Returns the buffer capacity this channel was constructed with.
    pub fn capacity(&self) -> usize {
        // SAFETY: lock held for the duration of the read.
        self.inner.lock.sync(|| unsafe { &*self.inner.state.get() }.capacity)
    }

    /// Returns a blocking iterator yielding values until the channel is
    /// closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { channel: self }
    }

    /// Stable identity for ordering lock acquisition across channels.
    pub(crate) fn lock_id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn lock(&self) {
        self.inner.lock.lock();
    }

    pub(crate) fn unlock(&self) {
        self.inner.lock.unlock();
    }

    // Nonblocking receive attempt for select. Channel lock held by caller.
    pub(crate) fn recv_internal(&self) -> Option<Result<T, RecvError>> {
        // SAFETY: caller holds the channel lock.
        let state = unsafe { &mut *self.inner.state.get() };
        match state.take() {
            Some(value) => Some(Ok(value)),
            None if state.closed => Some(Err(RecvError::Closed)),
            None => None,
        }
    }

    // Nonblocking send attempt for select. Channel lock held by caller.
    pub(crate) fn send_internal(&self, value: T) -> Result<Result<(), SendError<T>>, T> {
        // SAFETY: caller holds the channel lock.
        let state = unsafe { &mut *self.inner.state.get() };
        if state.closed {
            return Ok(Err(SendError::Closed(value)));
        }
        state.deliver(value).map(Ok)
    }

    // Enqueues a select-bound receiver waiter. Channel lock held by caller,
    // which already established that no value is ready and the channel is
    // open.
    pub(crate) fn watch_recv(&self, context: Arc<SelectContext>) -> Arc<ReceiverWaiter<T>> {
        // SAFETY: caller holds the channel lock.
        let state = unsafe { &mut *self.inner.state.get() };
        debug_assert!(!state.closed);
        let waiter = ReceiverWaiter::new(Some(context));
        state.receivers.push_back(waiter.clone());
        waiter
    }

    // Enqueues a select-bound sender waiter. Channel lock held by caller.
    pub(crate) fn watch_send(&self, value: T, context: Arc<SelectContext>) -> Arc<SenderWaiter<T>> {
        // SAFETY: caller holds the channel lock.
        let state = unsafe { &mut *self.inner.state.get() };
        debug_assert!(!state.closed);
        let waiter = SenderWaiter::new(value, Some(context));
        state.senders.push_back(waiter.clone());
        waiter
    }

    // Removes a stale select waiter left behind by a lost race. Takes the
    // channel lock itself.
    pub(crate) fn unwatch_recv(&self, waiter: &Arc<ReceiverWaiter<T>>) {
        self.inner.lock.sync(|| {
            // SAFETY: lock held.
            let state = unsafe { &mut *self.inner.state.get() };
            if let Some(position) = state.receivers.iter().position(|queued| Arc::ptr_eq(queued, waiter)) {
                state.receivers.remove(position);
            }
        });
    }

    pub(crate) fn unwatch_send(&self, waiter: &Arc<SenderWaiter<T>>) {
        self.inner.lock.sync(|| {
            // SAFETY: lock held.
            let state = unsafe { &mut *self.inner.state.get() };
            if let Some(position) = state.senders.iter().position(|queued| Arc::ptr_eq(queued, waiter)) {
                state.senders.remove(position);
            }
        });
    }
}

impl<T: Send> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel { inner: self.inner.clone() }
    }
}

/// A blocking iterator that borrows its source channel.
pub struct Iter<'a, T: Send> {
    channel: &'a Channel<T>,
}

impl<T: Send> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.channel.recv().ok()
    }
}

impl<T: Send> std::iter::FusedIterator for Iter<'_, T> {}

/// A blocking iterator that owns its source channel.
pub struct IntoIter<T: Send> {
    channel: Channel<T>,
}

impl<T: Send> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.channel.recv().ok()
    }
}

impl<T: Send> std::iter::FusedIterator for IntoIter<T> {}

impl<T: Send> IntoIterator for Channel<T> {
    type IntoIter = IntoIter<T>;
    type Item = T;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter { channel: self }
    }
}

impl<'a, T: Send> IntoIterator for &'a Channel<T> {
    type IntoIter = Iter<'a, T>;
    type Item = T;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use more_asserts::assert_ge;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fiber;

    #[test]
    fn buffered_send_recv() {
        let channel = Channel::new(2);
        channel.send(10).unwrap();
        channel.send(20).unwrap();
        assert_eq!(channel.recv(), Ok(10));
        assert_eq!(channel.recv(), Ok(20));
    }

    #[test]
    fn try_send_full() {
        let channel = Channel::new(2);
        channel.try_send(1).unwrap();
        channel.try_send(2).unwrap();
        assert_eq!(channel.try_send(3), Err(TrySendError::Full(3)));
        assert_eq!(channel.recv(), Ok(1));
        assert_eq!(channel.try_send(3), Ok(()));
    }

    #[test]
    fn try_recv_empty() {
        let channel = Channel::<i32>::new(1);
        assert_eq!(channel.try_recv(), Err(TryRecvError::Empty));
        channel.send(1).unwrap();
        assert_eq!(channel.try_recv(), Ok(1));
    }

    #[test]
    fn close_idempotent() {
        let channel = Channel::<i32>::new(1);
        assert!(!channel.is_closed());
        channel.close();
        assert!(channel.is_closed());
        channel.close();
        assert!(channel.is_closed());
    }

    #[test]
    fn closed_errors() {
        let channel = Channel::new(1);
        channel.close();
        assert_eq!(channel.send(1), Err(SendError::Closed(1)));
        assert_eq!(channel.try_send(2), Err(TrySendError::Closed(2)));
        assert_eq!(channel.recv(), Err(RecvError::Closed));
        assert_eq!(channel.recv_opt(), None);
        assert_eq!(channel.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn closed_buffer_drains() {
        let channel = Channel::new(3);
        channel.send(1).unwrap();
        channel.send(2).unwrap();
        channel.send(3).unwrap();
        channel.close();
        assert_eq!(channel.recv(), Ok(1));
        assert_eq!(channel.recv(), Ok(2));
        assert_eq!(channel.try_recv(), Ok(3));
        assert_eq!(channel.recv(), Err(RecvError::Closed));
    }

    #[test]
    fn rendezvous() {
        let channel = Channel::new(0);
        let sending = fiber::spawn({
            let channel = channel.clone();
            move || {
                channel.send(0).unwrap();
                channel.send(1).unwrap();
            }
        });
        assert_eq!(channel.recv(), Ok(0));
        assert_eq!(channel.recv(), Ok(1));
        sending.join().unwrap();
    }

    #[test]
    fn rendezvous_blocks_sender() {
        let channel = Channel::new(0);
        let sending = fiber::spawn({
            let channel = channel.clone();
            move || {
                let now = Instant::now();
                channel.send(5).unwrap();
                now.elapsed()
            }
        });
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(channel.recv(), Ok(5));
        assert_ge!(sending.join().unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn close_unparks_receiver() {
        let channel = Channel::<i32>::new(0);
        let closing = fiber::spawn({
            let channel = channel.clone();
            move || {
                std::thread::sleep(Duration::from_millis(20));
                channel.close();
            }
        });
        assert_eq!(channel.recv(), Err(RecvError::Closed));
        closing.join().unwrap();
    }

    #[test]
    fn close_unparks_sender() {
        let channel = Channel::new(0);
        let sending = fiber::spawn({
            let channel = channel.clone();
            move || channel.send(7)
        });
        std::thread::sleep(Duration::from_millis(20));
        channel.close();
        assert_eq!(sending.join().unwrap(), Err(SendError::Closed(7)));
    }

    #[test]
    fn capacity_accessor() {
        assert_eq!(Channel::<i32>::new(0).capacity(), 0);
        assert_eq!(Channel::<i32>::new(4).capacity(), 4);
    }

    #[test]
    fn iterator_drains() {
        let channel = Channel::new(3);
        channel.send(1).unwrap();
        channel.send(2).unwrap();
        channel.send(3).unwrap();
        channel.close();

        let mut iter = channel.into_iter();
        assert_eq!(iter.next(), Some(1));
        assert_eq!(iter.next(), Some(2));
        assert_eq!(iter.next(), Some(3));
        assert_eq!(iter.next(), None);
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn buffered_fifo_with_blocked_sender() {
        let channel = Channel::new(1);
        channel.send(1).unwrap();
        let sending = fiber::spawn({
            let channel = channel.clone();
            move || channel.send(2).unwrap()
        });
        std::thread::sleep(Duration::from_millis(20));
        // The parked sender's value lands behind the buffered one.
        assert_eq!(channel.recv(), Ok(1));
        assert_eq!(channel.recv(), Ok(2));
        sending.join().unwrap();
    }
}
