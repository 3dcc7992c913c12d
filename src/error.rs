//! Common errors for channel operations.

/// Error for blocking send.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendError<T> {
    /// Channel closed before the value could be delivered. Carries the value back.
    Closed(T),
}

/// Error for nonblocking send.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// Channel buffer full and no receiver waiting.
    Full(T),
    /// Channel closed.
    Closed(T),
}

/// Error for blocking receive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecvError {
    /// Channel closed with no value left to deliver.
    Closed,
}

/// Error for nonblocking receive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TryRecvError {
    /// Channel open but no value available.
    Empty,
    /// Channel closed with no value left to deliver.
    Closed,
}

impl<T> From<SendError<T>> for TrySendError<T> {
    fn from(err: SendError<T>) -> Self {
        let SendError::Closed(value) = err;
        TrySendError::Closed(value)
    }
}

impl<T> From<TrySendError<T>> for SendError<T> {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Closed(value) => SendError::Closed(value),
            TrySendError::Full(_) => panic!("got full error in blocking send"),
        }
    }
}

impl From<RecvError> for TryRecvError {
    fn from(err: RecvError) -> Self {
        let RecvError::Closed = err;
        TryRecvError::Closed
    }
}

impl From<TryRecvError> for RecvError {
    fn from(err: TryRecvError) -> Self {
        match err {
            TryRecvError::Closed => RecvError::Closed,
            TryRecvError::Empty => panic!("got empty error in blocking receive"),
        }
    }
}
