use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, Once};

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

use ircontrol_shared::link::LinkError;
use ircontrol_shared::{Interface, IrCode, Message};

use crate::actions::Transmitter;

#[derive(Default)]
struct LinkState {
    connected: bool,
    failing_connects: usize,
    connect_attempts: usize,
    inbound: VecDeque<Message>,
    sent: Vec<Message>,
}

/// In-memory serial link. Clones share state.
#[derive(Clone, Default)]
pub struct MockLink(Arc<Mutex<LinkState>>);

impl MockLink {
    pub fn connected() -> Self {
        let link = MockLink::default();
        link.0.lock().connected = true;
        link
    }

    /// Starts disconnected and refuses the first `n` connects.
    pub fn failing_connects(n: usize) -> Self {
        let link = MockLink::default();
        link.0.lock().failing_connects = n;
        link
    }

    pub fn push_inbound(&self, msg: Message) {
        self.0.lock().inbound.push_back(msg);
    }

    pub fn drop_connection(&self) {
        self.0.lock().connected = false;
    }

    pub fn sent(&self) -> Vec<Message> {
        self.0.lock().sent.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.0.lock().connect_attempts
    }
}

impl Interface for MockLink {
    fn connect(&mut self, _port: &str, _baudrate: u32) -> Result<(), LinkError> {
        let mut state = self.0.lock();
        state.connect_attempts += 1;
        if state.connect_attempts <= state.failing_connects {
            return Err(LinkError::NotConnected);
        }
        state.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.0.lock().connected
    }

    fn get_message(&mut self) -> Option<Message> {
        self.0.lock().inbound.pop_front()
    }

    fn put_message(&mut self, msg: &Message) -> Result<(), LinkError> {
        let mut state = self.0.lock();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        state.sent.push(*msg);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Name(String),
    Code(IrCode),
}

#[derive(Default)]
pub struct RecordingTransmitter(Mutex<Vec<Sent>>);

impl RecordingTransmitter {
    pub fn sent(&self) -> Vec<Sent> {
        self.0.lock().clone()
    }
}

impl Transmitter for RecordingTransmitter {
    fn send_by_name(&self, name: &str) {
        self.0.lock().push(Sent::Name(name.to_string()));
    }

    fn send_by_code(&self, code: &IrCode) {
        self.0.lock().push(Sent::Code(*code));
    }
}

thread_local! {
    static CAPTURED: RefCell<Option<Vec<(Level, String)>>> = const { RefCell::new(None) };
}

/// Records log lines emitted on threads that called [`capture_logs`].
struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        CAPTURED.with(|captured| {
            if let Some(lines) = captured.borrow_mut().as_mut() {
                lines.push((record.level(), record.args().to_string()));
            }
        });
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;
static INSTALL: Once = Once::new();

/// Start capturing log lines on the current thread, dropping earlier ones.
pub fn capture_logs() {
    INSTALL.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Trace);
        }
    });
    CAPTURED.with(|captured| *captured.borrow_mut() = Some(Vec::new()));
}

pub fn captured_logs() -> Vec<(Level, String)> {
    CAPTURED.with(|captured| captured.borrow().clone().unwrap_or_default())
}
