//! # Typed channels and multi-way select for cooperative fibers
//! `handoff` provides a typed [Channel] for exchanging values between
//! fibers without shared mutable memory, and a [select!] macro to commit to
//! exactly one of several pending channel operations.
//!
//! ## Usage
//! Construct a [Channel] with an explicit capacity. Capacity 0 transfers
//! every value by rendezvous; a positive capacity buffers that many values
//! before senders block.
//!
//! ### Channel
//! * Use [Channel::send] and [Channel::recv] to transfer values; both park
//!   the calling fiber until the operation completes or the channel closes.
//! * Use [Channel::try_send] and [Channel::try_recv] to attempt a transfer
//!   without blocking.
//! * Use [Channel::close] to wake every blocked peer with the closed
//!   outcome. Values buffered before the close are still delivered.
//!
//! ### Select
//! * Use [select!] to wait on several operations and run exactly one clause.
//! * Use [select::recv_first] and [select::send_first] for homogeneous sets.
//! * Timeouts and cancellation are composed by selecting against a dedicated
//!   channel that a timer or canceller fiber closes or sends to.
//!
//! ## Example
//! ```rust
//! use handoff::fiber;
//! use handoff::{select, Channel, RecvError};
//!
//! let jobs = Channel::<u32>::new(2);
//! let results = Channel::<u32>::new(2);
//!
//! let worker = fiber::spawn({
//!     let jobs = jobs.clone();
//!     let results = results.clone();
//!     move || {
//!         for job in &jobs {
//!             results.send(job * 2).unwrap();
//!         }
//!         results.close();
//!     }
//! });
//!
//! jobs.send(3).unwrap();
//! jobs.send(4).unwrap();
//! jobs.close();
//!
//! let mut sum = 0;
//! loop {
//!     select! {
//!         r = <-results => match r {
//!             Ok(n) => sum += n,
//!             Err(RecvError::Closed) => break,
//!         },
//!     }
//! }
//! assert_eq!(sum, 14);
//! worker.join().unwrap();
//! ```

mod channel;
mod error;
pub mod fiber;
mod lock;
pub mod select;
mod select_macro;

pub use channel::{Channel, IntoIter, Iter};
pub use error::{RecvError, SendError, TryRecvError, TrySendError};
pub use select::{recv_first, send_first, RecvAction, SelectAction, SendAction};
