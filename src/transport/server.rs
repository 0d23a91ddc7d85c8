use crate::transport::frame::{read_frame, write_frame, FrameError, DEFAULT_MAX_FRAME_SIZE};
use crate::transport::{Connection, Endpoint, Listener};
use crate::{cb_debug, cb_info, cb_warn, muted_error};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct TransportOptions {
    /// Exclusive upper bound of an incoming frame length.
    pub max_frame_size: u32,
    /// Delay after a failed accept.
    pub accept_backoff: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            accept_backoff: Duration::from_millis(50),
        }
    }
}

struct Shared {
    closed: AtomicBool,
    /// Clone of the connection currently served, used to unblock its reader.
    active: Mutex<Option<Connection>>,
    local: Endpoint,
}

/// Single-client frame server.
///
/// Accepts one client at a time, hands every incoming frame payload to a handler and writes
/// the handler's reply back as a frame. On client disconnect or a broken frame it returns to
/// the accept state, until closed by a [`TransportCloser`].
pub struct TransportServer {
    listener: Listener,
    options: TransportOptions,
    shared: Arc<Shared>,
}

impl TransportServer {
    pub fn bind(endpoint: &Endpoint, options: TransportOptions) -> io::Result<Self> {
        let listener = Listener::bind(endpoint)?;
        let local = listener.local_endpoint()?;
        Ok(Self {
            listener,
            options,
            shared: Arc::new(Shared {
                closed: AtomicBool::new(false),
                active: Mutex::new(None),
                local,
            }),
        })
    }

    /// Endpoint the server actually listens on.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.shared.local
    }

    pub fn closer(&self) -> TransportCloser {
        TransportCloser {
            shared: self.shared.clone(),
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Serve clients until closed.
    pub fn run<H>(self, mut handler: H)
    where
        H: FnMut(&[u8]) -> Vec<u8>,
    {
        cb_info!(target: "transport", "listening on {}", self.shared.local);

        while !self.is_closed() {
            let (conn, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) => {
                    if self.is_closed() {
                        break;
                    }
                    cb_warn!(target: "transport", "accept failed: {err:#}");
                    std::thread::sleep(self.options.accept_backoff);
                    continue;
                }
            };

            if !self.register(&conn) {
                break;
            }
            cb_info!(target: "transport", "client connected: {peer}");

            match self.serve(conn, &mut handler) {
                Ok(()) => cb_info!(target: "transport", "client disconnected: {peer}"),
                Err(err) => {
                    cb_warn!(target: "transport", "drop connection {peer}: {err:#}")
                }
            }

            if let Ok(mut active) = self.shared.active.lock() {
                *active = None;
            }
        }

        cb_info!(target: "transport", "transport closed");
    }

    /// Publish the accepted connection for the closer, `false` if the server is closing.
    fn register(&self, conn: &Connection) -> bool {
        let Ok(mut active) = self.shared.active.lock() else {
            return false;
        };
        if self.is_closed() {
            return false;
        }
        *active = muted_error!(conn.try_clone(), "clone connection:");
        true
    }

    fn serve<H>(&self, mut conn: Connection, handler: &mut H) -> Result<(), FrameError>
    where
        H: FnMut(&[u8]) -> Vec<u8>,
    {
        loop {
            let payload = match read_frame(&mut conn, self.options.max_frame_size) {
                Ok(payload) => payload,
                Err(FrameError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            };
            cb_debug!(target: "transport", "<- frame of {} bytes", payload.len());

            let reply = handler(&payload);
            if self.is_closed() {
                return Ok(());
            }
            write_frame(&mut conn, &reply)?;
            cb_debug!(target: "transport", "-> frame of {} bytes", reply.len());
        }
    }
}

/// Handle that forcibly stops a running [`TransportServer`].
#[derive(Clone)]
pub struct TransportCloser {
    shared: Arc<Shared>,
}

impl TransportCloser {
    /// Unblock the server from a pending accept or read and make it return.
    pub fn close(&self) {
        {
            let mut active = match self.shared.active.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            self.shared.closed.store(true, Ordering::SeqCst);
            if let Some(conn) = active.take() {
                muted_error!(conn.shutdown(), "shutdown active connection:");
            }
        }

        // wake up a pending accept
        muted_error!(Connection::connect(&self.shared.local), "wake up listener:");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}
