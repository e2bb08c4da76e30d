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

use clap::Parser;
use serialport::{DataBits, Parity, StopBits};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use xyzupload::{AckReader, Progress, RealSerialPort, UploadRequest, UploadSession};

#[derive(Parser)]
#[command(name = "xyzupload")]
#[command(about = "Upload G-code to an XYZ printer over the XYZv3 serial protocol", long_about = None)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyACM0 or COM3)
    #[arg(short = 'c', long = "serial", value_name = "PORT")]
    port: String,

    /// G-code file to upload
    #[arg(short = 'p', long = "file", value_name = "FILE")]
    file: PathBuf,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name = "BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name = "BITS")]
    stop_bits: u8,

    /// Seconds to wait for the printer's "ok" after each command or block
    #[arg(long, default_value = "30", value_name = "SECS")]
    timeout: u64,

    /// Milliseconds to let the port settle after opening it
    #[arg(long, default_value = "500", value_name = "MS")]
    settle_ms: u64,

    /// Enable debug output
    #[arg(long)]
    debug: bool,
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn upload_banner(request: &UploadRequest, port: &str) -> String {
    format!(
        "Uploading {} ({} bytes) to {}",
        request.filename(),
        request.file_size(),
        port
    )
}

fn print_progress(progress: &Progress) {
    let mut stderr = std::io::stderr().lock();
    let _ = write!(
        stderr,
        "\r  Progress: {}% ({}/{} bytes, block {})",
        progress.percent, progress.bytes_sent, progress.file_size, progress.block_index
    );
    if progress.bytes_sent == progress.file_size {
        let _ = writeln!(stderr);
    }
    let _ = stderr.flush();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let settings = parse_data_bits(cli.data_bits).and_then(|data_bits| {
        Ok((data_bits, parse_parity(&cli.parity)?, parse_stop_bits(cli.stop_bits)?))
    });
    let (data_bits, parity, stop_bits) = match settings {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if !cli.file.is_file() {
        eprintln!("ERROR: File not found: {}", cli.file.display());
        return ExitCode::FAILURE;
    }

    let request = match UploadRequest::from_path(&cli.file) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("{}", upload_banner(&request, &cli.port));
    tracing::info!("Opening serial port: {}", cli.port);
    tracing::debug!(
        "Settings: {} baud, {:?}, {:?}, {:?}",
        cli.baud, data_bits, parity, stop_bits
    );

    let serial_port = match RealSerialPort::open(&cli.port, cli.baud, data_bits, parity, stop_bits) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return ExitCode::FAILURE;
        }
    };
    std::thread::sleep(Duration::from_millis(cli.settle_ms));

    let mut session = UploadSession::new(Box::new(serial_port))
        .with_ack_reader(AckReader::new(Duration::from_secs(cli.timeout)))
        .with_progress(print_progress);

    if session.run(&request) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
