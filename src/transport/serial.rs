//! Serial port transport
//!
//! Opening asserts DTR/RTS (the controller boards only start talking once
//! they see them), drops stale input and waits for the device to settle.
//! A reader thread assembles lines; closing deasserts the lines again.

use serialport::{ClearBuffer, SerialPort};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::lines::LineAssembler;
use super::{EventSender, Transport, TransportEvent};
use crate::error::TransportError;

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const SETTLE_DELAY: Duration = Duration::from_millis(500);

struct OpenPort {
    name: String,
    port: Box<dyn SerialPort>,
    reader: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    /// Set by the reader thread when the port fails underneath us
    failed: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct SerialTransport {
    inner: Option<OpenPort>,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn port_mut(&mut self) -> Result<&mut OpenPort, TransportError> {
        match self.inner.as_mut() {
            Some(open) if open.failed.load(Ordering::Relaxed) => Err(TransportError::Closed),
            Some(open) => Ok(open),
            None => Err(TransportError::NotConnected),
        }
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, port: &str, baud: u32, events: EventSender) -> Result<(), TransportError> {
        self.close();

        let open_err = |source| TransportError::Open {
            port: port.to_string(),
            source,
        };

        let mut serial = serialport::new(port, baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(open_err)?;
        serial.write_data_terminal_ready(true).map_err(open_err)?;
        serial.write_request_to_send(true).map_err(open_err)?;
        serial.clear(ClearBuffer::Input).map_err(open_err)?;
        std::thread::sleep(SETTLE_DELAY);

        let reader_port = serial.try_clone().map_err(open_err)?;
        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let reader = {
            let stop = Arc::clone(&stop);
            let failed = Arc::clone(&failed);
            std::thread::Builder::new()
                .name(format!("serial-rx-{}", port))
                .spawn(move || read_loop(reader_port, events, stop, failed))?
        };

        info!("✅ Serial port {} open at {} baud", port, baud);
        self.inner = Some(OpenPort {
            name: port.to_string(),
            port: serial,
            reader: Some(reader),
            stop,
            failed,
        });
        Ok(())
    }

    fn close(&mut self) {
        let Some(mut open) = self.inner.take() else {
            return;
        };

        open.stop.store(true, Ordering::Relaxed);
        if let Err(e) = open.port.write_data_terminal_ready(false) {
            debug!("Could not clear DTR on {}: {}", open.name, e);
        }
        if let Err(e) = open.port.write_request_to_send(false) {
            debug!("Could not clear RTS on {}: {}", open.name, e);
        }
        if let Some(reader) = open.reader.take() {
            let _ = reader.join();
        }
        info!("🔌 Serial port {} closed", open.name);
    }

    fn is_open(&self) -> bool {
        matches!(&self.inner, Some(open) if !open.failed.load(Ordering::Relaxed))
    }

    fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.send_bytes(text.as_bytes())
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let open = self.port_mut()?;
        open.port.write_all(bytes)?;
        open.port.flush()?;
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(
    mut port: Box<dyn SerialPort>,
    events: EventSender,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
) {
    let mut assembler = LineAssembler::new();
    let mut buf = [0u8; 256];

    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                for line in assembler.push(&buf[..n]) {
                    if events.send(TransportEvent::Line(line)).is_err() {
                        return;
                    }
                }
            },
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {},
            Err(e) => {
                warn!("Serial read failed: {}", e);
                failed.store(true, Ordering::Relaxed);
                let _ = events.send(TransportEvent::Closed(e.to_string()));
                return;
            },
        }
    }
    debug!("Serial reader stopped");
}
