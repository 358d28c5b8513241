//! Test doubles shared by the runtime and protocol tests.

use crate::runtime::interface::ConnectionInterface;
use crate::runtime::registry::{Handle, LogSink};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

/// Connection stand-in that records everything sent to it.
#[derive(Default)]
pub struct StubConn {
    handle: OnceLock<Handle>,
    id: Mutex<Option<String>>,
    received: Mutex<Vec<Vec<u8>>>,
    unicasts: Mutex<Vec<(String, Vec<u8>)>>,
    broadcasts: Mutex<Vec<Vec<u8>>>,
    logs: Mutex<Vec<String>>,
    stopped: Mutex<bool>,
}

impl StubConn {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_handle(&self, handle: Handle) {
        let _ = self.handle.set(handle);
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }

    pub fn unicasts(&self) -> Vec<(String, Vec<u8>)> {
        self.unicasts.lock().clone()
    }

    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.broadcasts.lock().clone()
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().clone()
    }

    pub fn stopped(&self) -> bool {
        *self.stopped.lock()
    }
}

impl ConnectionInterface for StubConn {
    fn handle(&self) -> Option<Handle> {
        self.handle.get().copied()
    }

    fn set_id(&self, id: &str) {
        *self.id.lock() = Some(id.to_owned());
    }

    fn id(&self) -> Option<String> {
        self.id.lock().clone()
    }

    fn read(&self) {}

    fn response(&self, message: &[u8]) {
        self.received.lock().push(message.to_vec());
    }

    fn unicast(&self, receiver_id: &str, message: &[u8]) {
        self.unicasts
            .lock()
            .push((receiver_id.to_owned(), message.to_vec()));
    }

    fn broadcast(&self, message: &[u8]) {
        self.broadcasts.lock().push(message.to_vec());
    }

    fn log(&self, message: &[u8]) {
        self.logs
            .lock()
            .push(String::from_utf8_lossy(message).into_owned());
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
    }
}

/// Log sink that keeps every line as `<id>: <message>`.
#[derive(Default)]
pub struct CountingSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl CountingSink {
    pub fn lines(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.lines)
    }
}

impl LogSink for CountingSink {
    fn log(&self, _handle: Option<Handle>, id: Option<&str>, message: &[u8]) {
        self.lines.lock().push(format!(
            "{}: {}",
            id.unwrap_or("-"),
            String::from_utf8_lossy(message)
        ));
    }
}
