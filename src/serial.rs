// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::io::{self, Read, Write};
use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};

/// Per-read timeout configured on a freshly opened port
const READ_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Transport Trait
// ============================================================================

/// Byte stream operations needed by the upload session
pub trait Transport: Send {
    /// Number of received bytes that can be read without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Reads into `buf`, blocking at most `timeout`. An error of kind
    /// `TimedOut` means nothing arrived.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Writes every byte of `buf` or fails.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Releases the underlying device. Calling it again is a no-op.
    fn close(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
}

fn closed_port() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial port is closed")
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Serial port transport backed by the serialport crate
pub struct RealSerialPort {
    name: String,
    port: Option<Box<dyn SerialPortTrait>>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, TransportError> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|source| TransportError::Open {
                port: port_name.to_string(),
                source,
            })?;

        tracing::debug!(port = port_name, baud_rate, "serial port opened");
        Ok(RealSerialPort {
            name: port_name.to_string(),
            port: Some(port),
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPortTrait>> {
        self.port.as_mut().ok_or_else(closed_port)
    }
}

impl Transport for RealSerialPort {
    fn bytes_available(&mut self) -> io::Result<usize> {
        let count = self.port()?.bytes_to_read().map_err(io::Error::from)?;
        Ok(count as usize)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let port = self.port()?;
        port.set_timeout(timeout).map_err(io::Error::from)?;
        port.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        Write::write_all(self.port()?, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self.port()?)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::debug!(port = %self.name, "serial port closed");
        }
    }
}

// ============================================================================
// Mock Transport for Testing
// ============================================================================

#[cfg(test)]
pub struct MockTransport {
    // Data to return on reads (None = one poll with nothing available)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
    // Fail the nth write_all call (0-based)
    fail_write: Option<usize>,
    writes: usize,
    unflushed: bool,
    closes: usize,
    expected_closes: usize,
}

#[cfg(test)]
impl MockTransport {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockTransport {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
            fail_write: None,
            writes: 0,
            unflushed: false,
            closes: 0,
            expected_closes: 0,
        }
    }

    /// Requires the transport to be closed exactly once before drop.
    pub fn expect_close(mut self) -> Self {
        self.expected_closes = 1;
        self
    }

    pub fn fail_write(mut self, nth: usize) -> Self {
        self.fail_write = Some(nth);
        self
    }
}

/// Scripts `text` as bytes that are all immediately available.
#[cfg(test)]
pub fn script(text: &[u8]) -> Vec<Option<u8>> {
    text.iter().copied().map(Some).collect()
}

/// In-memory sink for log output emitted while running a test body
#[cfg(test)]
#[derive(Clone, Default)]
pub struct LogCapture(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl LogCapture {
    /// Runs `f` with INFO and above captured into this buffer.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .without_time()
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl Transport for MockTransport {
    fn bytes_available(&mut self) -> io::Result<usize> {
        assert!(!self.unflushed, "polled for a response before flushing the last write");
        assert_eq!(self.closes, 0, "MockTransport used after close");

        if self.read_pos >= self.read_buffer.len() {
            return Ok(0);
        }

        // An empty poll consumes its marker
        if self.read_buffer[self.read_pos].is_none() {
            self.read_pos += 1;
            return Ok(0);
        }

        Ok(self.read_buffer[self.read_pos..]
            .iter()
            .take_while(|b| b.is_some())
            .count())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let mut bytes_read = 0;
        while bytes_read < buf.len() && self.read_pos < self.read_buffer.len() {
            match self.read_buffer[self.read_pos] {
                Some(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                    self.read_pos += 1;
                }
                None => break,
            }
        }

        if bytes_read == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Mock timeout"));
        }
        Ok(bytes_read)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        assert_eq!(self.closes, 0, "MockTransport used after close");
        let nth = self.writes;
        self.writes += 1;
        if self.fail_write == Some(nth) {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "Mock write failure"));
        }
        self.write_log.extend_from_slice(buf);
        self.unflushed = true;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.unflushed = false;
        Ok(())
    }

    fn close(&mut self) {
        self.closes += 1;
    }
}

#[cfg(test)]
impl Drop for MockTransport {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockTransport dropped with {} unconsumed responses (read {} of {})",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            self.closes, self.expected_closes,
            "MockTransport closed {} times, expected {}",
            self.closes, self.expected_closes
        );

        assert!(
            self.write_log == self.expected_writes,
            "MockTransport write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            &self.expected_writes[..self.expected_writes.len().min(64)],
            self.write_log.len(),
            &self.write_log[..self.write_log.len().min(64)]
        );
    }
}
