//! Serial port configuration and opening.
//!
//! Meters and their radio gateways typically sit behind an optical probe or a
//! USB serial adapter running 8N1 without flow control.

use std::time::Duration;

use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::error::{Error, Result};
use crate::log::LogCategories;

/// Default baud rate for meter probes.
pub const DEFAULT_BAUD_RATE: u32 = 9_600;

/// Default pause after opening before the port is considered usable.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Default window during which startup noise is read and discarded.
pub const DEFAULT_DRAIN_WINDOW: Duration = Duration::from_millis(200);

/// Default read/write timeout of the underlying port.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Default wake-up marker written by `initialize_session`.
pub const DEFAULT_WAKE_UP: [u8; 4] = [0x55, 0x55, 0x55, 0x55];

/// Configuration for one serial channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Data bits per character.
    pub data_bits: DataBits,
    /// Parity mode.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
    /// Flow control mode.
    pub flow_control: FlowControl,
    /// Read timeout of the port.
    pub read_timeout: Duration,
    /// Timeout for a single write.
    pub write_timeout: Duration,
    /// Delay after opening before draining noise.
    pub settle_delay: Duration,
    /// How long startup noise is drained after the settle delay.
    pub drain_window: Duration,
    /// Bytes written to clear a partially issued prior command.
    pub wake_up: Vec<u8>,
    /// Log verbosity flags.
    pub log: LogCategories,
}

impl ChannelConfig {
    /// Creates a new channel configuration with default settings.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            read_timeout: DEFAULT_IO_TIMEOUT,
            write_timeout: DEFAULT_IO_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            drain_window: DEFAULT_DRAIN_WINDOW,
            wake_up: DEFAULT_WAKE_UP.to_vec(),
            log: LogCategories::default(),
        }
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }

    /// Sets the line discipline.
    #[must_use]
    pub const fn line(mut self, data_bits: DataBits, parity: Parity, stop_bits: StopBits) -> Self {
        self.data_bits = data_bits;
        self.parity = parity;
        self.stop_bits = stop_bits;
        self
    }

    /// Sets the flow control mode.
    #[must_use]
    pub const fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Sets the read timeout.
    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the write timeout.
    #[must_use]
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the settle delay.
    #[must_use]
    pub const fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Sets the noise drain window.
    #[must_use]
    pub const fn drain_window(mut self, window: Duration) -> Self {
        self.drain_window = window;
        self
    }

    /// Sets the wake-up marker.
    #[must_use]
    pub fn wake_up(mut self, marker: impl Into<Vec<u8>>) -> Self {
        self.wake_up = marker.into();
        self
    }

    /// Sets the log categories.
    #[must_use]
    pub const fn log(mut self, log: LogCategories) -> Self {
        self.log = log;
        self
    }
}

/// Opens the serial port described by `config`.
pub(crate) fn open_port(config: &ChannelConfig) -> Result<SerialStream> {
    let mut stream = tokio_serial::new(&config.port, config.baud_rate)
        .data_bits(config.data_bits)
        .parity(config.parity)
        .stop_bits(config.stop_bits)
        .flow_control(config.flow_control)
        .timeout(config.read_timeout)
        .open_native_async()
        .map_err(Error::Serial)?;

    // Probes power the optical head from RTS/DTR on some adapters
    if let Err(e) = tokio_serial::SerialPort::write_request_to_send(&mut stream, false) {
        tracing::warn!("failed to clear RTS: {}", e);
    }

    Ok(stream)
}

/// Lists available serial ports.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
