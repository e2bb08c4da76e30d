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

//! XYZv3 upload protocol constants and block framing

use std::time::Duration;

/// Maximum number of payload bytes carried by one data frame
pub const BLOCK_SIZE: usize = 8192;

/// XOR key applied to the block index to form the frame trailer
pub const TRAILER_KEY: u32 = 0x5A5A_A5A5;

/// How long to wait for an `ok` line after each command or frame
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Status line the device sends when a command or frame was accepted
pub const ACK_LINE: &str = "ok";

/// Prefix of the command announcing an upload: `XYZv3/upload=<name>,<size>`
pub const UPLOAD_PREFIX: &str = "XYZv3/upload=";

/// Command closing an upload once every block was acknowledged
pub const FINISH_COMMAND: &str = "XYZv3/uploadDidFinish";

/// Index + Size header preceding the payload
pub const HEADER_LEN: usize = 8;

pub const TRAILER_LEN: usize = 4;

/// Builds the upload announcement line (without the terminating newline).
pub fn upload_command(filename: &str, file_size: u64) -> String {
    format!("{}{},{}", UPLOAD_PREFIX, filename, file_size)
}

/// Appends the line terminator and encodes a command for the wire.
pub fn command_bytes(command: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(command.len() + 1);
    bytes.extend_from_slice(command.as_bytes());
    bytes.push(b'\n');
    bytes
}

// ============================================================================
// Frame
// ============================================================================

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated: {0} bytes is shorter than header and trailer")]
    Truncated(usize),
    #[error("frame declares {0} payload bytes, limit is {max}", max = BLOCK_SIZE)]
    Oversized(u32),
    #[error("frame declares {declared} payload bytes but carries {actual}")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("bad trailer for block {index}: expected 0x{expected:08X}, got 0x{actual:08X}")]
    BadTrailer { index: u32, expected: u32, actual: u32 },
}

/// One numbered block of payload, as sent on the wire:
///
/// ```text
/// [index: u32 LE][size: u32 LE][payload: size bytes][index ^ 0x5A5AA5A5: u32 LE]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    index: u32,
    payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Panics in debug builds if `payload` exceeds [`BLOCK_SIZE`].
    pub fn new(index: u32, payload: &'a [u8]) -> Self {
        debug_assert!(payload.len() <= BLOCK_SIZE);
        Frame { index, payload }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn trailer(&self) -> u32 {
        trailer_for(self.index)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + TRAILER_LEN
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(self.payload);
        out.extend_from_slice(&self.trailer().to_le_bytes());
        out
    }

    /// Decodes exactly one frame occupying all of `bytes`, checking the
    /// declared size and the trailer.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN + TRAILER_LEN {
            return Err(FrameError::Truncated(bytes.len()));
        }

        let index = read_u32_le(&bytes[0..4]);
        let size = read_u32_le(&bytes[4..8]);
        if size as usize > BLOCK_SIZE {
            return Err(FrameError::Oversized(size));
        }

        let actual = bytes.len() - HEADER_LEN - TRAILER_LEN;
        if actual != size as usize {
            return Err(FrameError::LengthMismatch { declared: size, actual });
        }

        let trailer = read_u32_le(&bytes[bytes.len() - TRAILER_LEN..]);
        let expected = trailer_for(index);
        if trailer != expected {
            return Err(FrameError::BadTrailer { index, expected, actual: trailer });
        }

        Ok(Frame {
            index,
            payload: &bytes[HEADER_LEN..HEADER_LEN + actual],
        })
    }
}

pub fn trailer_for(index: u32) -> u32 {
    index ^ TRAILER_KEY
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    u32::from_le_bytes(word)
}

// ============================================================================
// Tests
// ============================================================================
