use std::io::{self, Read, Write};
use std::time::Duration;

use log::{debug, info, warn};
use serialport::{SerialPort, SerialPortInfo};

use crate::protocol::{Message, ProtocolError, PACKET_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),
    #[error("serial io: {0}")]
    Io(#[from] io::Error),
    #[error("serial port not connected")]
    NotConnected,
}

/// Connection to the microcontroller.
///
/// `get_message` must never block; it returns `None` when no complete packet is buffered.
pub trait Interface {
    fn connect(&mut self, port: &str, baudrate: u32) -> Result<(), LinkError>;
    fn is_connected(&self) -> bool;
    fn get_message(&mut self) -> Option<Message>;
    fn put_message(&mut self, msg: &Message) -> Result<(), LinkError>;
}

/// Cuts a serial byte stream into fixed size packets.
#[derive(Debug, Default)]
pub struct PacketReader {
    buf: heapless::Vec<u8, PACKET_SIZE>,
}

impl PacketReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes still needed to complete the current packet.
    pub fn remaining(&self) -> usize {
        PACKET_SIZE - self.buf.len()
    }

    /// Feed bytes, returns how many were consumed and the packet they completed, if any.
    pub fn push(&mut self, data: &[u8]) -> (usize, Option<Result<Message, ProtocolError>>) {
        let take = data.len().min(self.remaining());
        // Cannot overflow, `take` is bounded by the free capacity.
        let _ = self.buf.extend_from_slice(&data[..take]);

        if self.buf.is_full() {
            let decoded = Message::decode(&self.buf);
            self.buf.clear();
            (take, Some(decoded))
        } else {
            (take, None)
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

pub struct SerialLink {
    port: Option<Box<dyn SerialPort>>,
    reader: PacketReader,
}

impl SerialLink {
    pub fn new() -> Self {
        SerialLink {
            port: None,
            reader: PacketReader::new(),
        }
    }

    pub fn list_ports() -> Result<Vec<SerialPortInfo>, serialport::Error> {
        serialport::available_ports()
    }

    fn disconnect(&mut self, err: &dyn std::fmt::Display) {
        warn!("Serial port lost: {}", err);
        self.port = None;
        self.reader.reset();
    }
}

impl Default for SerialLink {
    fn default() -> Self {
        Self::new()
    }
}

impl Interface for SerialLink {
    fn connect(&mut self, port: &str, baudrate: u32) -> Result<(), LinkError> {
        let opened = serialport::new(port, baudrate)
            .timeout(Duration::from_millis(10))
            .open()?;

        info!("Connected to {} at {} baud", port, baudrate);
        self.port.replace(opened);
        self.reader.reset();

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn get_message(&mut self) -> Option<Message> {
        loop {
            let port = self.port.as_mut()?;

            let available = match port.bytes_to_read() {
                Ok(n) => n as usize,
                Err(e) => {
                    self.disconnect(&e);
                    return None;
                }
            };
            if available == 0 {
                return None;
            }

            let mut recvbuf = [0u8; PACKET_SIZE];
            let want = available.min(self.reader.remaining());
            let readlen = match port.read(&mut recvbuf[..want]) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => return None,
                Err(e) => {
                    self.disconnect(&e);
                    return None;
                }
            };

            match self.reader.push(&recvbuf[..readlen]) {
                (_, Some(Ok(msg))) => {
                    debug!("Received {}", msg);
                    return Some(msg);
                }
                (_, Some(Err(e))) => warn!("Discarding packet: {}", e),
                (_, None) => {}
            }
        }
    }

    fn put_message(&mut self, msg: &Message) -> Result<(), LinkError> {
        let port = self.port.as_mut().ok_or(LinkError::NotConnected)?;

        debug!("Sending {}", msg);
        if let Err(e) = port.write_all(&msg.encode()).and_then(|_| port.flush()) {
            self.disconnect(&e);
            return Err(e.into());
        }

        Ok(())
    }
}
