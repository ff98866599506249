//! Test doubles shared by the channel and engine tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::hci::EventPacket;
use crate::transport::{Error, HciEndpoint, TimerDriver, TimerHandle};

/// An endpoint that records every sent frame
#[derive(Default)]
pub(crate) struct FakeEndpoint {
    sent: Mutex<Vec<Box<[u8]>>>,
    fail_sends: Mutex<bool>,
}

impl FakeEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeEndpoint::default())
    }

    /// Take all frames sent since the last call
    pub fn take_sent(&self) -> Vec<Box<[u8]>> {
        std::mem::replace(&mut *self.sent.lock().unwrap(), Vec::new())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.lock().unwrap() = fail;
    }
}

impl HciEndpoint for FakeEndpoint {
    fn send(&self, frame: &[u8]) -> Result<(), Error> {
        if *self.fail_sends.lock().unwrap() {
            return Err(Error::Closed);
        }

        self.sent.lock().unwrap().push(Box::from(frame));

        Ok(())
    }

    fn receive(&self, _buffer: &mut [u8]) -> Result<Option<usize>, Error> {
        Ok(None)
    }
}

type ArmedTimer = (Duration, Box<dyn FnOnce() + Send>);

/// A timer driver advanced by hand from the test body
#[derive(Default)]
pub(crate) struct FakeTimerDriver {
    armed: Mutex<BTreeMap<u64, ArmedTimer>>,
    next_id: AtomicU64,
}

impl FakeTimerDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeTimerDriver::default())
    }

    pub fn armed_count(&self) -> usize {
        self.armed.lock().unwrap().len()
    }

    /// Fire one armed timer, running its callback
    pub fn fire(&self, timer: TimerHandle) {
        let callback = self.armed.lock().unwrap().remove(&timer.0);

        if let Some((_, callback)) = callback {
            callback();
        }
    }

    /// Fire every armed timer in arming order
    pub fn fire_all(&self) {
        loop {
            let first = {
                let mut armed = self.armed.lock().unwrap();

                match armed.keys().next().copied() {
                    Some(id) => armed.remove(&id),
                    None => None,
                }
            };

            match first {
                Some((_, callback)) => callback(),
                None => return,
            }
        }
    }

    /// The handle of the earliest armed timer
    pub fn first_armed(&self) -> Option<TimerHandle> {
        self.armed.lock().unwrap().keys().next().copied().map(TimerHandle)
    }

    /// The handle of the most recently armed timer
    pub fn last_armed(&self) -> Option<TimerHandle> {
        self.armed.lock().unwrap().keys().next_back().copied().map(TimerHandle)
    }
}

impl TimerDriver for FakeTimerDriver {
    fn schedule(
        &self,
        delay: Duration,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Result<TimerHandle, Error> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;

        self.armed.lock().unwrap().insert(id, (delay, callback));

        Ok(TimerHandle(id))
    }

    fn cancel(&self, timer: TimerHandle) -> bool {
        self.armed.lock().unwrap().remove(&timer.0).is_some()
    }
}

/// Frame a command complete event with a one byte status return parameter
pub(crate) fn command_complete_frame(num_packets: u8, opcode: u16, status: u8) -> EventPacket {
    let opcode_bytes = opcode.to_le_bytes();

    let raw = [0x0E, 4, num_packets, opcode_bytes[0], opcode_bytes[1], status];

    EventPacket::from_packet(&raw).unwrap()
}

/// Frame a command complete event that only refreshes the credit window
pub(crate) fn command_complete_quota_frame(num_packets: u8) -> EventPacket {
    EventPacket::from_packet(&[0x0E, 3, num_packets, 0, 0]).unwrap()
}

/// Frame a command status event
pub(crate) fn command_status_frame(status: u8, num_packets: u8, opcode: u16) -> EventPacket {
    let opcode_bytes = opcode.to_le_bytes();

    let raw = [0x0F, 4, status, num_packets, opcode_bytes[0], opcode_bytes[1]];

    EventPacket::from_packet(&raw).unwrap()
}

/// Frame a disconnection complete event
pub(crate) fn disconnection_complete_frame(handle: u16, reason: u8) -> EventPacket {
    let handle_bytes = handle.to_le_bytes();

    let raw = [0x05, 4, 0x00, handle_bytes[0], handle_bytes[1], reason];

    EventPacket::from_packet(&raw).unwrap()
}
