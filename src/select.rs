//! Waiting on multiple channel operations simultaneously.
//!
//! A select builds one action per candidate operation and commits to exactly
//! one of them. All involved channels are locked in a globally consistent
//! order, each action gets one nonblocking attempt, and if none is ready all
//! of them are armed under a single shared activation token before the fiber
//! parks. Whichever channel fires first transitions the token; every other
//! armed waiter becomes a stale entry that the wakeup sweep removes.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use num_enum::IntoPrimitive;
use static_assertions::assert_impl_all;

use crate::channel::{Channel, ReceiverWaiter, SenderWaiter};
use crate::error::{RecvError, SendError};
use crate::fiber;

/// Lifecycle of one select invocation, shared by all of its actions.
#[repr(u8)]
#[derive(Copy, Clone, IntoPrimitive)]
enum SelectState {
    Active = 0,
    Done = 1,
}

/// Activation token binding an armed waiter to its select invocation.
///
/// Every action of one select holds a context pointing at the same shared
/// state; whichever channel first transitions that state owns the wakeup.
pub struct SelectContext {
    shared: Arc<AtomicU8>,
    activated: AtomicBool,
}

assert_impl_all!(SelectContext: Send, Sync);

impl SelectContext {
    fn new(shared: Arc<AtomicU8>) -> Arc<SelectContext> {
        Arc::new(SelectContext { shared, activated: AtomicBool::new(false) })
    }

    // One compare-and-set decides the winning branch across all channels.
    // Only the winner may perform the transfer and restore the fiber.
    pub(crate) fn try_trigger(&self) -> bool {
        let active = SelectState::Active.into();
        let done = SelectState::Done.into();
        if self.shared.compare_exchange(active, done, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            self.activated.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }
}

/// One candidate operation of a [select] invocation.
///
/// `try_execute` and `arm` are called with the channel lock already held by
/// the coordinator; `disarm` takes the lock itself.
pub trait SelectAction {
    /// Stable total-orderable identity of the underlying channel.
    fn lock_id(&self) -> usize;

    /// Acquires the underlying channel's lock.
    fn lock(&self);

    /// Releases the underlying channel's lock.
    fn unlock(&self);

    /// Attempts the operation without blocking. Returns true if it completed
    /// and the outcome is stored in the action; a closed channel counts as
    /// completed.
    fn try_execute(&mut self) -> bool;

    /// Enqueues a waiter bound to `context` on the underlying channel.
    fn arm(&mut self, context: Arc<SelectContext>);

    /// Removes this action's waiter if a lost race left it queued.
    fn disarm(&mut self);
}

/// Receive operation on a channel, for use with [select].
pub struct RecvAction<'a, T: Send> {
    channel: &'a Channel<T>,
    result: Option<Result<T, RecvError>>,
    waiter: Option<Arc<ReceiverWaiter<T>>>,
}

impl<'a, T: Send> RecvAction<'a, T> {
    pub fn new(channel: &'a Channel<T>) -> Self {
        RecvAction { channel, result: None, waiter: None }
    }

    /// Returns the received value. Call only on the winning action.
    pub fn into_result(self) -> Result<T, RecvError> {
        if let Some(result) = self.result {
            return result;
        }
        match self.waiter {
            Some(waiter) => waiter.finish(),
            None => unreachable!("select action resolved without outcome"),
        }
    }
}

impl<T: Send> SelectAction for RecvAction<'_, T> {
    fn lock_id(&self) -> usize {
        self.channel.lock_id()
    }

    fn lock(&self) {
        self.channel.lock();
    }

    fn unlock(&self) {
        self.channel.unlock();
    }

    fn try_execute(&mut self) -> bool {
        match self.channel.recv_internal() {
            Some(result) => {
                self.result = Some(result);
                true
            },
            None => false,
        }
    }

    fn arm(&mut self, context: Arc<SelectContext>) {
        self.waiter = Some(self.channel.watch_recv(context));
    }

    fn disarm(&mut self) {
        if let Some(waiter) = &self.waiter {
            self.channel.unwatch_recv(waiter);
        }
    }
}

/// Send operation on a channel, for use with [select].
///
/// The value moves into the action up front; if another action wins it is
/// dropped with the action, and a closed channel hands it back through
/// [SendError::Closed].
pub struct SendAction<'a, T: Send> {
    channel: &'a Channel<T>,
    value: Option<T>,
    result: Option<Result<(), SendError<T>>>,
    waiter: Option<Arc<SenderWaiter<T>>>,
}

impl<'a, T: Send> SendAction<'a, T> {
    pub fn new(channel: &'a Channel<T>, value: T) -> Self {
        SendAction { channel, value: Some(value), result: None, waiter: None }
    }

    /// Returns the send outcome. Call only on the winning action.
    pub fn into_result(self) -> Result<(), SendError<T>> {
        if let Some(result) = self.result {
            return result;
        }
        match self.waiter {
            Some(waiter) => waiter.finish(),
            None => unreachable!("select action resolved without outcome"),
        }
    }
}

impl<T: Send> SelectAction for SendAction<'_, T> {
    fn lock_id(&self) -> usize {
        self.channel.lock_id()
    }

    fn lock(&self) {
        self.channel.lock();
    }

    fn unlock(&self) {
        self.channel.unlock();
    }

    fn try_execute(&mut self) -> bool {
        let value = match self.value.take() {
            Some(value) => value,
            None => unreachable!("send action executed twice"),
        };
        match self.channel.send_internal(value) {
            Ok(result) => {
                self.result = Some(result);
                true
            },
            Err(value) => {
                self.value = Some(value);
                false
            },
        }
    }

    fn arm(&mut self, context: Arc<SelectContext>) {
        let value = match self.value.take() {
            Some(value) => value,
            None => unreachable!("send action armed while ready"),
        };
        self.waiter = Some(self.channel.watch_send(value, context));
    }

    fn disarm(&mut self) {
        if let Some(waiter) = &self.waiter {
            self.channel.unwatch_send(waiter);
        }
    }
}

/// Commits to exactly one of `actions`.
///
/// Returns the index of the completed action; its result is read from the
/// action afterwards. With `has_default` true and no action immediately
/// ready, returns `actions.len()` instead of blocking.
///
/// # Panics
/// Panics when called with no actions and no default, which would otherwise
/// park the fiber forever.
pub fn select(actions: &mut [&mut dyn SelectAction], has_default: bool) -> usize {
    assert!(has_default || !actions.is_empty(), "select with no actions and no `default`");

    // Lock every involved channel in address order so that overlapping
    // selects cannot deadlock each other. Actions sharing a channel share a
    // lock acquisition.
    let mut order: Vec<usize> = (0..actions.len()).collect();
    order.sort_by_key(|&index| actions[index].lock_id());
    order.dedup_by_key(|&mut index| actions[index].lock_id());
    for &index in &order {
        actions[index].lock();
    }

    // One nonblocking attempt each, in declaration order.
    let mut ready = None;
    for (index, action) in actions.iter_mut().enumerate() {
        if action.try_execute() {
            ready = Some(index);
            break;
        }
    }
    if let Some(index) = ready {
        unlock_all(actions, &order);
        return index;
    }
    if has_default {
        unlock_all(actions, &order);
        return actions.len();
    }

    // Nothing ready: arm every action under one shared activation token and
    // park. The locks are held from the ready scan through arming, so no
    // channel can change state in between.
    let shared = Arc::new(AtomicU8::new(SelectState::Active.into()));
    let contexts: Vec<Arc<SelectContext>> = (0..actions.len()).map(|_| SelectContext::new(shared.clone())).collect();
    for (action, context) in actions.iter_mut().zip(&contexts) {
        action.arm(context.clone());
    }
    unlock_all(actions, &order);

    fiber::reschedule();

    // Exactly one channel triggered the token and restored us. The other
    // channels may still queue our waiters; scrub them before reading the
    // outcome.
    for action in actions.iter_mut() {
        action.disarm();
    }
    match contexts.iter().position(|context| context.is_activated()) {
        Some(index) => index,
        None => unreachable!("select woken without a winning branch"),
    }
}

fn unlock_all(actions: &mut [&mut dyn SelectAction], order: &[usize]) {
    for &index in order.iter().rev() {
        actions[index].unlock();
    }
}

/// Receives the first value that arrives on any of `channels`.
///
/// # Panics
/// Panics if `channels` is empty.
pub fn recv_first<T: Send>(channels: &[Channel<T>]) -> Result<T, RecvError> {
    let mut actions: Vec<RecvAction<'_, T>> = channels.iter().map(RecvAction::new).collect();
    let index = {
        let mut refs: Vec<&mut dyn SelectAction> =
            actions.iter_mut().map(|action| action as &mut dyn SelectAction).collect();
        select(&mut refs, false)
    };
    actions.swap_remove(index).into_result()
}

/// Sends `value` to whichever of `channels` accepts it first.
///
/// # Panics
/// Panics if `channels` is empty.
pub fn send_first<T: Send + Clone>(value: T, channels: &[Channel<T>]) -> Result<(), SendError<T>> {
    let mut actions: Vec<SendAction<'_, T>> =
        channels.iter().map(|channel| SendAction::new(channel, value.clone())).collect();
    let index = {
        let mut refs: Vec<&mut dyn SelectAction> =
            actions.iter_mut().map(|action| action as &mut dyn SelectAction).collect();
        select(&mut refs, false)
    };
    actions.swap_remove(index).into_result()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fiber;

    #[test]
    fn ready_recv() {
        let names = Channel::new(1);
        let numbers = Channel::<i32>::new(1);
        names.send("x").unwrap();

        let mut recv_names = RecvAction::new(&names);
        let mut recv_numbers = RecvAction::new(&numbers);
        let index = select(&mut [&mut recv_names, &mut recv_numbers], false);
        assert_eq!(index, 0);
        assert_eq!(recv_names.into_result(), Ok("x"));
    }

    #[test]
    fn ready_order_is_declaration_order() {
        let first = Channel::new(1);
        let second = Channel::new(1);
        first.send(1).unwrap();
        second.send(2).unwrap();

        let mut recv_second = RecvAction::new(&second);
        let mut recv_one = RecvAction::new(&first);
        let index = select(&mut [&mut recv_second, &mut recv_one], false);
        assert_eq!(index, 0);
        assert_eq!(recv_second.into_result(), Ok(2));
    }

    #[test]
    fn ready_send() {
        let full = Channel::new(1);
        let empty = Channel::new(1);
        full.send(1).unwrap();

        let mut send_full = SendAction::new(&full, 10);
        let mut send_empty = SendAction::new(&empty, 20);
        let index = select(&mut [&mut send_full, &mut send_empty], false);
        assert_eq!(index, 1);
        assert_eq!(send_empty.into_result(), Ok(()));
        assert_eq!(empty.recv(), Ok(20));
    }

    #[test]
    fn default_when_nothing_ready() {
        let channel = Channel::<i32>::new(0);
        let mut recv = RecvAction::new(&channel);
        let index = select(&mut [&mut recv], true);
        assert_eq!(index, 1);
    }

    #[test]
    fn default_without_actions() {
        let index = select(&mut [], true);
        assert_eq!(index, 0);
    }

    #[test]
    fn closed_channel_is_ready() {
        let open = Channel::<i32>::new(0);
        let closed = Channel::<i32>::new(0);
        closed.close();

        let mut recv_open = RecvAction::new(&open);
        let mut recv_closed = RecvAction::new(&closed);
        let index = select(&mut [&mut recv_open, &mut recv_closed], false);
        assert_eq!(index, 1);
        assert_eq!(recv_closed.into_result(), Err(RecvError::Closed));
    }

    #[test]
    fn closed_channel_send_is_ready() {
        let closed = Channel::new(1);
        closed.close();

        let mut send_closed = SendAction::new(&closed, 5);
        let index = select(&mut [&mut send_closed], false);
        assert_eq!(index, 0);
        assert_eq!(send_closed.into_result(), Err(SendError::Closed(5)));
    }

    #[test]
    fn blocked_recv_wakes_on_send() {
        let first = Channel::new(0);
        let second = Channel::<i32>::new(0);
        let sending = fiber::spawn({
            let first = first.clone();
            move || {
                std::thread::sleep(Duration::from_millis(20));
                first.send("late").unwrap();
            }
        });

        let mut recv_first = RecvAction::new(&first);
        let mut recv_second = RecvAction::new(&second);
        let index = select(&mut [&mut recv_first, &mut recv_second], false);
        assert_eq!(index, 0);
        assert_eq!(recv_first.into_result(), Ok("late"));
        sending.join().unwrap();
    }

    #[test]
    fn blocked_send_wakes_on_recv() {
        let full = Channel::new(1);
        full.send(1).unwrap();
        let receiving = fiber::spawn({
            let full = full.clone();
            move || {
                std::thread::sleep(Duration::from_millis(20));
                full.recv().unwrap()
            }
        });

        let mut send_full = SendAction::new(&full, 2);
        let index = select(&mut [&mut send_full], false);
        assert_eq!(index, 0);
        assert_eq!(send_full.into_result(), Ok(()));
        assert_eq!(receiving.join().unwrap(), 1);
        assert_eq!(full.recv(), Ok(2));
    }

    #[test]
    fn blocked_recv_wakes_on_close() {
        let channel = Channel::<i32>::new(0);
        let closing = fiber::spawn({
            let channel = channel.clone();
            move || {
                std::thread::sleep(Duration::from_millis(20));
                channel.close();
            }
        });

        let mut recv = RecvAction::new(&channel);
        let index = select(&mut [&mut recv], false);
        assert_eq!(index, 0);
        assert_eq!(recv.into_result(), Err(RecvError::Closed));
        closing.join().unwrap();
    }

    #[test]
    fn same_channel_both_ways() {
        let channel = Channel::new(0);
        let receiving = fiber::spawn({
            let channel = channel.clone();
            move || {
                std::thread::sleep(Duration::from_millis(20));
                channel.recv().unwrap()
            }
        });

        let mut recv = RecvAction::new(&channel);
        let mut send = SendAction::new(&channel, 9);
        let index = select(&mut [&mut recv, &mut send], false);
        assert_eq!(index, 1);
        assert_eq!(send.into_result(), Ok(()));
        assert_eq!(receiving.join().unwrap(), 9);
    }

    #[test]
    fn recv_first_ready() {
        let channels = [Channel::new(1), Channel::new(1)];
        channels[1].send(3).unwrap();
        assert_eq!(recv_first(&channels), Ok(3));
    }

    #[test]
    fn send_first_picks_open_slot() {
        let channels = [Channel::new(1), Channel::new(1)];
        channels[0].send(1).unwrap();
        assert_eq!(send_first(2, &channels), Ok(()));
        assert_eq!(channels[1].recv(), Ok(2));
    }
}
