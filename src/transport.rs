use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tracing::debug;

use crate::errors::{DeviceError, DeviceResult};

/// One blocking request/response round trip against a line-oriented serial
/// device. Implementations must serialize concurrent transactions: the wire
/// protocols carry no request identifiers, so only one command may be in
/// flight per physical port.
pub trait Transport: Send + Sync {
    /// Writes `payload`, then reads until `terminator` (inclusive) or the
    /// port deadline. The returned bytes include the terminator.
    fn transact(&self, payload: &[u8], terminator: u8) -> DeviceResult<Vec<u8>>;
}

pub struct SerialDevice {
    name: String,
    timeout: Duration,
    port: Mutex<Box<dyn SerialPort>>,
}

impl SerialDevice {
    pub fn open(path: &str, baud: u32, timeout: Duration, name: &str) -> DeviceResult<Self> {
        debug!(port = path, baud, "opening serial port");
        let port = serialport::new(path, baud)
            // short read timeout so the deadline loop can poll for bytes
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| DeviceError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(SerialDevice {
            name: name.to_string(),
            timeout,
            port: Mutex::new(port),
        })
    }
}

impl Transport for SerialDevice {
    fn transact(&self, payload: &[u8], terminator: u8) -> DeviceResult<Vec<u8>> {
        let mut port = self
            .port
            .lock()
            .map_err(|_| DeviceError::Internal("serial port lock poisoned".to_string()))?;
        debug!(dev = %self.name, tx = ?payload, "TX");

        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| DeviceError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        port.write_all(payload)?;
        port.flush()?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match port.read(&mut byte) {
                Ok(1) => {
                    buf.push(byte[0]);
                    if byte[0] == terminator {
                        debug!(dev = %self.name, rx = ?buf, "RX");
                        return Ok(buf);
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(DeviceError::Io(e)),
            }
            if Instant::now() >= deadline {
                debug!(dev = %self.name, rx = ?buf, "RX timeout");
                return Err(DeviceError::Timeout { partial: buf });
            }
        }
    }
}
