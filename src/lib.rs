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

//! Host-side uploader for the XYZv3 block-transfer protocol
//!
//! A print job is pushed to the device in three lockstep phases, each write
//! answered by a textual `ok` line on the same serial stream:
//!
//! 1. `XYZv3/upload=<name>,<size>`
//! 2. the file as numbered binary frames of up to 8192 bytes
//! 3. `XYZv3/uploadDidFinish`

pub mod ack;
pub mod protocol;
pub mod serial;
pub mod upload;

pub use ack::AckReader;
pub use serial::{RealSerialPort, Transport, TransportError};
pub use upload::{Progress, SessionState, UploadError, UploadRequest, UploadSession};
