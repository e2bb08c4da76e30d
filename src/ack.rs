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

//! Detection of the textual `ok` acknowledgment on the shared byte stream

use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use crate::protocol::{ACK_LINE, DEFAULT_ACK_TIMEOUT};
use crate::serial::Transport;

/// Longest unterminated line kept while waiting for its newline
pub const MAX_LINE_LEN: usize = 1024;

/// Sleep between polls while the transport has nothing to read
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Bound on a single one-byte read once the port reported data
const BYTE_READ_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Line Scanner
// ============================================================================

/// Accumulates bytes and yields complete, trimmed, non-empty lines.
#[derive(Debug, Default)]
pub struct LineScanner {
    partial: Vec<u8>,
}

impl LineScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte. Returns the finished line when `byte` is a newline
    /// and the line is not blank after trimming.
    pub fn push(&mut self, byte: u8) -> Option<String> {
        if byte != b'\n' {
            if self.partial.len() >= MAX_LINE_LEN {
                warn!(len = self.partial.len(), "dropping over-long status line");
                self.partial.clear();
            }
            self.partial.push(byte);
            return None;
        }

        let line = String::from_utf8_lossy(&self.partial).trim().to_string();
        self.partial.clear();
        if line.is_empty() { None } else { Some(line) }
    }

    /// Feeds a run of bytes, returning every line completed by it.
    #[cfg(test)]
    pub fn extend(&mut self, bytes: &[u8]) -> Vec<String> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }

    pub fn pending(&self) -> &[u8] {
        &self.partial
    }
}

// ============================================================================
// Ack Reader
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct AckReader {
    timeout: Duration,
}

impl Default for AckReader {
    fn default() -> Self {
        AckReader::new(DEFAULT_ACK_TIMEOUT)
    }
}

impl AckReader {
    pub fn new(timeout: Duration) -> Self {
        AckReader { timeout }
    }

    /// Waits until a line reading exactly `ok` arrives or the timeout
    /// elapses. A timeout yields `Ok(false)`; only transport faults are
    /// errors. Other status lines are logged and skipped.
    ///
    /// Bytes are consumed one at a time so anything after the `ok` line
    /// stays in the transport.
    pub fn wait_for_ok(&self, transport: &mut dyn Transport) -> io::Result<bool> {
        let start = Instant::now();
        let mut scanner = LineScanner::new();
        let mut byte = [0u8; 1];

        while start.elapsed() < self.timeout {
            let available = transport.bytes_available()?;
            if available == 0 {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }

            for _ in 0..available {
                if start.elapsed() >= self.timeout {
                    break;
                }

                match transport.read_timeout(&mut byte, BYTE_READ_TIMEOUT) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                    Err(e) => return Err(e),
                }

                if let Some(line) = scanner.push(byte[0]) {
                    info!("<< {}", line);
                    if line == ACK_LINE {
                        return Ok(true);
                    }
                }
            }
        }

        if !scanner.pending().is_empty() {
            debug!(
                pending = %String::from_utf8_lossy(scanner.pending()),
                "discarding unterminated status line"
            );
        }
        Ok(false)
    }
}

// ============================================================================
// Tests
// ============================================================================
