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

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use crate::ack::AckReader;
use crate::protocol::*;
use crate::serial::Transport;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cannot upload {}: file name is missing or contains ',' or a newline", .0.display())]
    InvalidFileName(PathBuf),
    #[error("source ended after {actual} of {expected} announced bytes")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("file needs more than {} blocks", u32::MAX)]
    TooManyBlocks,
    #[error("session already started (state: {0})")]
    AlreadyStarted(SessionState),
}

// ============================================================================
// States
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initiating,
    Transferring,
    Finalizing,
    Succeeded,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Request & Progress
// ============================================================================

/// What to upload: the name announced to the device, its length, and
/// where to read it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    filename: String,
    file_size: u64,
    source: PathBuf,
}

impl UploadRequest {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let file_size = std::fs::metadata(path)?.len();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| UploadError::InvalidFileName(path.to_path_buf()))?;

        if filename.contains([',', '\n', '\r']) {
            return Err(UploadError::InvalidFileName(path.to_path_buf()));
        }

        Ok(UploadRequest {
            filename,
            file_size,
            source: path.to_path_buf(),
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn open(&self) -> io::Result<File> {
        File::open(&self.source)
    }

    /// Number of frames needed for the whole file.
    pub fn block_count(&self) -> u64 {
        self.file_size.div_ceil(BLOCK_SIZE as u64)
    }
}

/// Reported after every acknowledged block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub percent: u8,
    pub bytes_sent: u64,
    pub file_size: u64,
    /// Blocks acknowledged so far
    pub block_index: u32,
}

impl Progress {
    fn new(bytes_sent: u64, file_size: u64, block_index: u32) -> Self {
        let percent = if file_size == 0 {
            100
        } else {
            (bytes_sent.saturating_mul(100) / file_size).min(100) as u8
        };
        Progress { percent, bytes_sent, file_size, block_index }
    }
}

type ProgressSink = Box<dyn FnMut(&Progress) + Send>;

// ============================================================================
// Session
// ============================================================================

/// Drives the three-phase XYZv3 upload over a transport it owns. The
/// transport is closed exactly once, when `run` finishes or when the
/// session is dropped, whichever comes first.
pub struct UploadSession {
    transport: Box<dyn Transport>,
    ack: AckReader,
    state: SessionState,
    progress: Option<ProgressSink>,
    closed: bool,
}

impl UploadSession {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        UploadSession {
            transport,
            ack: AckReader::default(),
            state: SessionState::Idle,
            progress: None,
            closed: false,
        }
    }

    pub fn with_ack_reader(mut self, ack: AckReader) -> Self {
        self.ack = ack;
        self
    }

    pub fn with_progress<F>(mut self, sink: F) -> Self
    where
        F: FnMut(&Progress) + Send + 'static,
    {
        self.progress = Some(Box::new(sink));
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!("state: {} -> {}", self.state, next);
        self.state = next;
    }

    fn send_command(&mut self, command: &str) -> Result<bool, UploadError> {
        info!(">> {}", command);
        self.transport.write_all(&command_bytes(command))?;
        self.transport.flush()?;
        Ok(self.ack.wait_for_ok(self.transport.as_mut())?)
    }

    /// Announces the upload with `XYZv3/upload=<name>,<size>`.
    pub fn initiate(&mut self, request: &UploadRequest) -> Result<bool, UploadError> {
        self.transition(SessionState::Initiating);
        info!("[1/3] Initializing upload...");

        let command = upload_command(request.filename(), request.file_size());
        if self.send_command(&command)? {
            return Ok(true);
        }

        error!("Failed to initialize upload (no ok response)");
        self.transition(SessionState::Failed);
        Ok(false)
    }

    /// Streams `source` as numbered frames, waiting for `ok` after each.
    /// At most `request.file_size()` bytes are read; a source that ends
    /// early is an error.
    pub fn transfer_blocks<R: Read>(
        &mut self,
        request: &UploadRequest,
        source: R,
    ) -> Result<bool, UploadError> {
        self.transition(SessionState::Transferring);
        info!("[2/3] Transferring data in {}-byte blocks...", BLOCK_SIZE);

        let file_size = request.file_size();
        let mut source = source.take(file_size);
        let mut buffer = vec![0u8; BLOCK_SIZE];
        let mut block_index: u32 = 0;
        let mut bytes_sent: u64 = 0;

        loop {
            let len = read_chunk(&mut source, &mut buffer)?;
            if len == 0 {
                break;
            }

            let frame = Frame::new(block_index, &buffer[..len]);
            self.transport.write_all(&frame.encode())?;
            self.transport.flush()?;
            debug!(
                block = block_index,
                size = len,
                trailer = frame.trailer(),
                "sent frame"
            );

            if !self.ack.wait_for_ok(self.transport.as_mut())? {
                error!("Failed to send block {} (no ok response)", block_index);
                self.transition(SessionState::Failed);
                return Ok(false);
            }

            bytes_sent += len as u64;
            block_index = block_index.checked_add(1).ok_or(UploadError::TooManyBlocks)?;

            let progress = Progress::new(bytes_sent, file_size, block_index);
            debug!(
                "Progress: {}% ({}/{} bytes, block {})",
                progress.percent, bytes_sent, file_size, block_index
            );
            if let Some(sink) = self.progress.as_mut() {
                sink(&progress);
            }
        }

        if bytes_sent != file_size {
            return Err(UploadError::SizeMismatch { expected: file_size, actual: bytes_sent });
        }

        info!("Sent {} blocks total", block_index);
        Ok(true)
    }

    /// Sends `XYZv3/uploadDidFinish`.
    pub fn finalize(&mut self) -> Result<bool, UploadError> {
        self.transition(SessionState::Finalizing);
        info!("[3/3] Finalizing upload...");

        if self.send_command(FINISH_COMMAND)? {
            self.transition(SessionState::Succeeded);
            return Ok(true);
        }

        error!("Failed to finalize upload (no ok response)");
        self.transition(SessionState::Failed);
        Ok(false)
    }

    /// Runs initiate, transfer and finalize in order, stopping at the first
    /// failure. Faults are logged and reported as `false`. The transport is
    /// closed before returning.
    pub fn run(&mut self, request: &UploadRequest) -> bool {
        let result = self.run_phases(request);
        self.close();

        match result {
            Ok(true) => {
                info!("SUCCESS: File uploaded successfully!");
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!(phase = %self.state, "Upload failed: {}", e);
                if !self.state.is_terminal() {
                    self.transition(SessionState::Failed);
                }
                false
            }
        }
    }

    fn run_phases(&mut self, request: &UploadRequest) -> Result<bool, UploadError> {
        if self.state != SessionState::Idle {
            return Err(UploadError::AlreadyStarted(self.state));
        }

        debug!(
            "Uploading {} ({} bytes, {} blocks)",
            request.filename(),
            request.file_size(),
            request.block_count()
        );

        if !self.initiate(request)? {
            return Ok(false);
        }

        let source = request.open()?;
        if !self.transfer_blocks(request, source)? {
            return Ok(false);
        }

        self.finalize()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.transport.close();
        }
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Fills `buf` from `reader` until it is full or the reader is exhausted.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use crate::serial::{script, LogCapture, MockTransport};

    const OK: &[u8] = b"ok\n";

    fn quick_ack() -> AckReader {
        AckReader::new(Duration::from_millis(20))
    }

    fn source_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> UploadRequest {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        UploadRequest::from_path(&path).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn expected_frame(index: u32, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(&(index ^ 0x5A5AA5A5).to_le_bytes());
        out
    }

    fn oks(count: usize) -> Vec<Option<u8>> {
        script(&OK.repeat(count))
    }

    /// Reader that hands out at most a few bytes per call
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.0.len().min(buf.len()).min(7);
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_request_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let request = source_file(&dir, "benchy.gcode", &pattern(10000));
        assert_eq!(request.filename(), "benchy.gcode");
        assert_eq!(request.file_size(), 10000);
        assert_eq!(request.block_count(), 2);
        assert_eq!(request.source, dir.path().join("benchy.gcode"));
    }

    #[test]
    fn test_request_rejects_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a,b.gcode");
        std::fs::write(&path, b"G28\n").unwrap();
        assert!(matches!(
            UploadRequest::from_path(&path),
            Err(UploadError::InvalidFileName(_))
        ));

        assert!(matches!(
            UploadRequest::from_path(dir.path().join("missing.gcode")),
            Err(UploadError::Io(_))
        ));
    }

    #[test]
    fn test_empty_file_upload() {
        let dir = tempfile::tempdir().unwrap();
        let request = source_file(&dir, "empty.gcode", b"");

        let mut expected_writes = b"XYZv3/upload=empty.gcode,0\n".to_vec();
        expected_writes.extend_from_slice(b"XYZv3/uploadDidFinish\n");

        let transport = MockTransport::new(oks(2), expected_writes).expect_close();
        let mut session = UploadSession::new(Box::new(transport)).with_ack_reader(quick_ack());

        assert!(session.run(&request));
        assert_eq!(session.state(), SessionState::Succeeded);
    }

    #[test]
    fn test_commands_and_replies_are_logged_at_info() {
        let dir = tempfile::tempdir().unwrap();
        let request = source_file(&dir, "empty.gcode", b"");

        let mut expected_writes = b"XYZv3/upload=empty.gcode,0\n".to_vec();
        expected_writes.extend_from_slice(b"XYZv3/uploadDidFinish\n");

        let mut responses = script(b"E1\n");
        responses.extend(oks(2));
        let transport = MockTransport::new(responses, expected_writes).expect_close();
        let mut session = UploadSession::new(Box::new(transport)).with_ack_reader(quick_ack());

        let logs = LogCapture::default();
        assert!(logs.run(|| session.run(&request)));

        let output = logs.contents();
        assert!(output.contains(">> XYZv3/upload=empty.gcode,0"), "missing command in:\n{}", output);
        assert!(output.contains("<< E1"), "missing status line in:\n{}", output);
        assert!(output.contains(">> XYZv3/uploadDidFinish"), "missing command in:\n{}", output);
        assert!(!output.contains("state:"), "transitions leaked above debug:\n{}", output);
    }

    #[test]
    fn test_two_block_upload() {
        let dir = tempfile::tempdir().unwrap();
        let content = pattern(10000);
        let request = source_file(&dir, "part.gcode", &content);

        let mut expected_writes = b"XYZv3/upload=part.gcode,10000\n".to_vec();
        expected_writes.extend(expected_frame(0, &content[..8192]));
        expected_writes.extend(expected_frame(1, &content[8192..]));
        expected_writes.extend_from_slice(b"XYZv3/uploadDidFinish\n");

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);

        let transport = MockTransport::new(oks(4), expected_writes).expect_close();
        let mut session = UploadSession::new(Box::new(transport))
            .with_ack_reader(quick_ack())
            .with_progress(move |p| sink.lock().unwrap().push(*p));

        assert!(session.run(&request));
        assert_eq!(session.state(), SessionState::Succeeded);
        assert_eq!(
            *updates.lock().unwrap(),
            vec![
                Progress { percent: 81, bytes_sent: 8192, file_size: 10000, block_index: 1 },
                Progress { percent: 100, bytes_sent: 10000, file_size: 10000, block_index: 2 },
            ]
        );
    }

    #[test]
    fn test_frames_on_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let content = pattern(10000);
        let request = source_file(&dir, "part.gcode", &content);

        let mut frames = expected_frame(0, &content[..8192]);
        let second = frames.len();
        frames.extend(expected_frame(1, &content[8192..]));

        let first = Frame::parse(&frames[..second]).unwrap();
        let last = Frame::parse(&frames[second..]).unwrap();
        assert_eq!((first.index(), first.payload().len(), first.trailer()), (0, 8192, 0x5A5AA5A5));
        assert_eq!((last.index(), last.payload().len(), last.trailer()), (1, 1808, 0x5A5AA5A4));

        let transport = MockTransport::new(oks(2), frames).expect_close();
        let mut session = UploadSession::new(Box::new(transport)).with_ack_reader(quick_ack());
        assert!(session.transfer_blocks(&request, request.open().unwrap()).unwrap());
    }

    #[test]
    fn test_block_counts_and_sizes() {
        let dir = tempfile::tempdir().unwrap();

        for size in [1usize, 8191, 8192, 8193, 16384, 20000] {
            let content = pattern(size);
            let request = source_file(&dir, "sized.gcode", &content);

            let mut expected_writes = Vec::new();
            for (index, chunk) in content.chunks(BLOCK_SIZE).enumerate() {
                expected_writes.extend(expected_frame(index as u32, chunk));
            }
            let blocks = size.div_ceil(BLOCK_SIZE);
            assert_eq!(request.block_count(), blocks as u64);

            let counter = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&counter);

            let transport = MockTransport::new(oks(blocks), expected_writes).expect_close();
            let mut session = UploadSession::new(Box::new(transport))
                .with_ack_reader(quick_ack())
                .with_progress(move |p| sink.lock().unwrap().push(p.block_index));

            // A reader returning short reads must still yield full blocks
            assert!(session.transfer_blocks(&request, Trickle(&content)).unwrap());
            assert_eq!(*counter.lock().unwrap(), (1..=blocks as u32).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_block_ack_timeout_stops_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let content = pattern(10 * BLOCK_SIZE);
        let request = source_file(&dir, "ten.gcode", &content);

        // init + blocks 0..=2 acknowledged, block 3 never is
        let mut expected_writes = format!("XYZv3/upload=ten.gcode,{}\n", 10 * BLOCK_SIZE).into_bytes();
        for index in 0..4 {
            let start = index * BLOCK_SIZE;
            expected_writes.extend(expected_frame(index as u32, &content[start..start + BLOCK_SIZE]));
        }

        let transport = MockTransport::new(oks(4), expected_writes).expect_close();
        let mut session = UploadSession::new(Box::new(transport)).with_ack_reader(quick_ack());

        assert!(!session.run(&request));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_initiate_timeout_skips_later_phases() {
        let dir = tempfile::tempdir().unwrap();
        let request = source_file(&dir, "part.gcode", &pattern(100));

        let mut responses = script(b"busy\n");
        responses.push(None);
        let transport = MockTransport::new(responses, b"XYZv3/upload=part.gcode,100\n".to_vec())
            .expect_close();
        let mut session = UploadSession::new(Box::new(transport)).with_ack_reader(quick_ack());

        assert!(!session.run(&request));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_finalize_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let content = pattern(10);
        let request = source_file(&dir, "tiny.gcode", &content);

        let mut expected_writes = b"XYZv3/upload=tiny.gcode,10\n".to_vec();
        expected_writes.extend(expected_frame(0, &content));
        expected_writes.extend_from_slice(b"XYZv3/uploadDidFinish\n");

        let transport = MockTransport::new(oks(2), expected_writes).expect_close();
        let mut session = UploadSession::new(Box::new(transport)).with_ack_reader(quick_ack());

        assert!(!session.run(&request));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_write_fault_closes_transport() {
        let dir = tempfile::tempdir().unwrap();
        let content = pattern(3 * BLOCK_SIZE);
        let request = source_file(&dir, "fault.gcode", &content);

        // Second write (block 0) fails
        let transport = MockTransport::new(
            oks(1),
            format!("XYZv3/upload=fault.gcode,{}\n", 3 * BLOCK_SIZE).into_bytes(),
        )
        .fail_write(1)
        .expect_close();
        let mut session = UploadSession::new(Box::new(transport)).with_ack_reader(quick_ack());

        assert!(!session.run(&request));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_short_source_is_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let content = pattern(100);
        let request = source_file(&dir, "shrunk.gcode", &content);

        let transport = MockTransport::new(oks(1), expected_frame(0, &content[..60])).expect_close();
        let mut session = UploadSession::new(Box::new(transport)).with_ack_reader(quick_ack());

        let result = session.transfer_blocks(&request, &content[..60]);
        assert!(matches!(
            result,
            Err(UploadError::SizeMismatch { expected: 100, actual: 60 })
        ));
    }

    #[test]
    fn test_long_source_is_truncated_to_announced_size() {
        let dir = tempfile::tempdir().unwrap();
        let content = pattern(100);
        let request = source_file(&dir, "grown.gcode", &content[..40]);

        let transport = MockTransport::new(oks(1), expected_frame(0, &content[..40])).expect_close();
        let mut session = UploadSession::new(Box::new(transport)).with_ack_reader(quick_ack());

        assert!(session.transfer_blocks(&request, &content[..]).unwrap());
    }

    #[test]
    fn test_session_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let request = source_file(&dir, "empty.gcode", b"");

        let mut expected_writes = b"XYZv3/upload=empty.gcode,0\n".to_vec();
        expected_writes.extend_from_slice(b"XYZv3/uploadDidFinish\n");

        let transport = MockTransport::new(oks(2), expected_writes).expect_close();
        let mut session = UploadSession::new(Box::new(transport)).with_ack_reader(quick_ack());

        assert!(session.run(&request));
        assert!(!session.run(&request));
        assert_eq!(session.state(), SessionState::Succeeded);
    }

    #[test]
    fn test_drop_closes_unrun_session() {
        let transport = MockTransport::new(vec![], vec![]).expect_close();
        drop(UploadSession::new(Box::new(transport)));
    }

    #[test]
    fn test_progress_percent_floors() {
        assert_eq!(Progress::new(8192, 10000, 1).percent, 81);
        assert_eq!(Progress::new(1, 3, 1).percent, 33);
        assert_eq!(Progress::new(3, 3, 1).percent, 100);
        assert_eq!(Progress::new(0, 0, 0).percent, 100);
    }
}
