use std::io::{self, Read, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};

use crate::config::LinkConfig;

/// Narrow seam over the raw serial device.
///
/// The transport worker only needs line-oriented reads and writes; keeping
/// the surface this small lets the worker run against an in-memory fake in
/// tests while production talks to a real UART.
pub trait SerialLink: Send {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
    fn write_line(&mut self, line: &str) -> io::Result<()>;
    /// Non-blocking poll for one complete inbound line. Returns `Ok(None)`
    /// when no full line is available yet.
    fn poll_line(&mut self) -> io::Result<Option<String>>;
}

/// Production link over a USB/UART radio module, 8N1 framing.
pub struct SerialPortLink {
    port_name: String,
    baud_rate: u32,
    read_timeout: Duration,
    port: Option<Box<dyn serialport::SerialPort>>,
    rx_buf: Vec<u8>,
}

impl SerialPortLink {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            port_name: config.port.clone(),
            baud_rate: config.baud_rate,
            read_timeout: config.read_timeout(),
            port: None,
            rx_buf: Vec::new(),
        }
    }

    fn take_buffered_line(&mut self) -> Option<String> {
        let pos = self.rx_buf.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.rx_buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        Some(line)
    }
}

impl SerialLink for SerialPortLink {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            debug!("serial port {} already open", self.port_name);
            return Ok(());
        }

        info!("Opening {} at {} baud", self.port_name, self.baud_rate);
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(self.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .open()
            .with_context(|| format!("failed to open serial port {}", self.port_name))?;

        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            self.rx_buf.clear();
            info!("Closed serial port {}", self.port_name);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port not open"))?;
        port.write_all(line.as_bytes())?;
        port.flush()
    }

    fn poll_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.take_buffered_line() {
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }

            let port = match self.port.as_mut() {
                Some(p) => p,
                None => return Ok(None),
            };

            let pending = port
                .bytes_to_read()
                .map_err(|e| io::Error::other(e.to_string()))? as usize;
            if pending == 0 {
                return Ok(None);
            }

            let mut chunk = vec![0u8; pending.min(512)];
            let n = port.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            self.rx_buf.extend_from_slice(&chunk[..n]);
        }
    }
}
