//! Hand-off of work between the I/O thread and the owner thread of the bridge state.
//!
//! The owner thread is the only one that touches the state. Other threads send it tasks
//! and wait for the result, tasks are executed one at a time in the order they were sent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender};

type OwnerTask<S> = dyn FnOnce(&mut S) + Send;

pub enum Request<S> {
    Exit,
    Task(Box<OwnerTask<S>>),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ExchangeError {
    #[error("messaging disabled")]
    MessagingDisabled,
    #[error("owner thread is gone")]
    OwnerGone,
}

pub struct OwnerExchanger<S> {
    requests: Receiver<Request<S>>,
}

impl<S> OwnerExchanger<S> {
    pub fn next_request(&self) -> Option<Request<S>> {
        self.requests.recv().ok()
    }
}

pub struct ClientExchanger<S> {
    messaging_enabled: AtomicBool,
    requests: Sender<Request<S>>,
}

impl<S: 'static> ClientExchanger<S> {
    #[inline(always)]
    pub fn is_messaging_enabled(&self) -> bool {
        self.messaging_enabled.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn enable_messaging(&self) {
        self.messaging_enabled.store(true, Ordering::Relaxed);
    }

    /// Disable messaging, all requests will return [`ExchangeError::MessagingDisabled`].
    #[inline(always)]
    pub fn disable_messaging(&self) {
        self.messaging_enabled.store(false, Ordering::Relaxed);
    }

    /// Run `f` on the owner thread and wait for its result.
    ///
    /// There is no timeout: the caller is blocked until the owner executes the task.
    pub fn request_sync<T, F>(&self, f: F) -> Result<T, ExchangeError>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> T + Send + 'static,
    {
        if !self.is_messaging_enabled() {
            return Err(ExchangeError::MessagingDisabled);
        }

        let (reply_tx, reply_rx) = sync_channel::<T>(1);
        let task = Box::new(move |state: &mut S| {
            _ = reply_tx.send(f(state));
        });
        self.requests
            .send(Request::Task(task))
            .map_err(|_| ExchangeError::OwnerGone)?;
        // the reply sender is dropped without a send if the task panics or is discarded
        reply_rx.recv().map_err(|_| ExchangeError::OwnerGone)
    }

    pub fn send_exit(&self) {
        _ = self.requests.send(Request::Exit);
    }
}

/// Create an exchanger pair.
///
/// [`OwnerExchanger`] must be used by the thread that owns the state, see [`serve`].
/// [`ClientExchanger`] is used by any other thread to send requests.
pub fn exchanger<S>() -> (OwnerExchanger<S>, ClientExchanger<S>) {
    let (req_tx, req_rx) = channel::<Request<S>>();
    (
        OwnerExchanger { requests: req_rx },
        ClientExchanger {
            messaging_enabled: AtomicBool::new(true),
            requests: req_tx,
        },
    )
}

/// Owner thread loop: execute incoming tasks until [`Request::Exit`] or until every client
/// is dropped, then give the state back.
pub fn serve<S>(mut state: S, exchanger: OwnerExchanger<S>) -> S {
    while let Some(request) = exchanger.next_request() {
        match request {
            Request::Task(task) => task(&mut state),
            Request::Exit => break,
        }
    }
    state
}
