//! Duplex device link
//!
//! A [`Transport`] is opened by the supervisor, written by the link writer and
//! reports received lines through the event channel handed to `open`. Calls
//! block on device I/O, so async code reaches it through
//! [`SharedTransport`] on blocking threads.

pub mod lines;
pub mod serial;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub use lines::LineAssembler;
pub use serial::SerialTransport;

/// Something the receive side observed
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One complete, trimmed, non-empty line
    Line(String),
    /// The link failed underneath us; the reason is for logs only
    Closed(String),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Device link capability
pub trait Transport: Send {
    /// Open `port` at `baud`, delivering received lines to `events`
    fn open(&mut self, port: &str, baud: u32, events: EventSender) -> Result<(), TransportError>;

    /// Close the link; a no-op when already closed
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Write text and flush
    fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    /// Write raw bytes and flush
    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Transport shared between the supervisor and the link writer
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

pub fn shared(transport: impl Transport + 'static) -> SharedTransport {
    Arc::new(Mutex::new(Box::new(transport)))
}

#[cfg(test)]
pub(crate) mod fake {
    //! Recording transport used by tests across the crate

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Written {
        Text(String),
        Bytes(Vec<u8>),
    }

    #[derive(Default)]
    pub struct FakeTransport {
        pub open: bool,
        pub opens: usize,
        pub closes: usize,
        /// Remaining open attempts that fail
        pub fail_opens: usize,
        /// Fail every write once this many writes succeeded
        pub fail_writes_after: Option<usize>,
        /// Port still open but its reader died
        pub lost: bool,
        pub written: Vec<Written>,
        pub events: Option<EventSender>,
    }

    impl FakeTransport {
        pub fn opened() -> Self {
            Self {
                open: true,
                ..Self::default()
            }
        }

        /// Number of raw byte writes, i.e. image chunks
        pub fn chunk_count(&self) -> usize {
            self.written
                .iter()
                .filter(|w| matches!(w, Written::Bytes(_)))
                .count()
        }

        pub fn texts(&self) -> Vec<String> {
            self.written
                .iter()
                .filter_map(|w| match w {
                    Written::Text(t) => Some(t.clone()),
                    Written::Bytes(_) => None,
                })
                .collect()
        }

        /// Simulate a line arriving from the device
        pub fn receive(&self, line: &str) {
            if let Some(tx) = &self.events {
                let _ = tx.send(TransportEvent::Line(line.to_string()));
            }
        }

        fn write(&mut self, w: Written) -> Result<(), TransportError> {
            if !self.open {
                return Err(TransportError::NotConnected);
            }
            if self.lost {
                return Err(TransportError::Closed);
            }
            if matches!(self.fail_writes_after, Some(n) if self.written.len() >= n) {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "device unplugged",
                )));
            }
            self.written.push(w);
            Ok(())
        }
    }

    /// Handle that lets a test inspect a transport it handed away
    #[derive(Clone, Default)]
    pub struct SharedFake(pub Arc<Mutex<FakeTransport>>);

    impl SharedFake {
        pub fn new(inner: FakeTransport) -> Self {
            Self(Arc::new(Mutex::new(inner)))
        }

        pub fn get(&self) -> parking_lot::MutexGuard<'_, FakeTransport> {
            self.0.lock()
        }
    }

    impl Transport for SharedFake {
        fn open(&mut self, port: &str, baud: u32, events: EventSender) -> Result<(), TransportError> {
            self.0.lock().open(port, baud, events)
        }

        fn close(&mut self) {
            self.0.lock().close()
        }

        fn is_open(&self) -> bool {
            self.0.lock().is_open()
        }

        fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
            self.0.lock().send_text(text)
        }

        fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.0.lock().send_bytes(bytes)
        }
    }

    impl Transport for FakeTransport {
        fn open(&mut self, port: &str, _baud: u32, events: EventSender) -> Result<(), TransportError> {
            self.opens += 1;
            if self.fail_opens > 0 {
                self.fail_opens -= 1;
                return Err(TransportError::Open {
                    port: port.to_string(),
                    source: serialport::Error::new(serialport::ErrorKind::NoDevice, "no such port"),
                });
            }
            self.open = true;
            self.events = Some(events);
            Ok(())
        }

        fn close(&mut self) {
            if self.open {
                self.closes += 1;
            }
            self.open = false;
            self.events = None;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
            self.write(Written::Text(text.to_string()))
        }

        fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.write(Written::Bytes(bytes.to_vec()))
        }
    }
}
