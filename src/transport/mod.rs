//! Endpoint ownership and supervision
//!
//! The platform driver is reached through [`HciDevice`], which opens the two framed
//! endpoints. [`Transport`] owns both channels, wires the inbound routing between them, and
//! propagates peer closure upward through a single closed callback. On unix the read loop and
//! the timer wheel live in [`unix::IoWorker`]; everything else in the library is platform
//! neutral and only sees the [`HciEndpoint`] and [`TimerDriver`] traits.

#[cfg(unix)]
pub mod unix;

use core::fmt;
use core::time::Duration;
use std::sync::{Arc, Mutex};

use crate::hci::acl::AclDataChannel;
use crate::hci::command_channel::CommandChannel;
use crate::hci::CommandPacket;
use crate::BluetoothDeviceAddress;

/// Transport level errors
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The peer end of an endpoint is gone
    Closed,
    /// An operating system level failure, kept as text since nothing above retries on it
    Io(String),
    /// The device wrapper does not implement the requested optional capability
    Unsupported(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Closed => write!(f, "endpoint closed by peer"),
            Error::Io(reason) => write!(f, "endpoint io error: {}", reason),
            Error::Unsupported(what) => write!(f, "not supported by this device: {}", what),
        }
    }
}

impl std::error::Error for Error {}

/// One framed bidirectional endpoint
///
/// Each call to [`receive`](HciEndpoint::receive) returns at most one whole frame; the device
/// wrapper is responsible for preserving frame boundaries (HCI packets never span reads).
pub trait HciEndpoint: Send + Sync {
    /// Write one frame to the controller
    fn send(&self, frame: &[u8]) -> Result<(), Error>;

    /// Read one frame without blocking
    ///
    /// Returns the frame size, or `None` when no frame is waiting.
    fn receive(&self, buffer: &mut [u8]) -> Result<Option<usize>, Error>;
}

/// Feature bit for the multi advertising vendor extension
pub const VENDOR_FEATURE_MULTI_ADVERTISING: u32 = 1 << 0;

/// Vendor extension commands this library knows how to ask for
///
/// The wire encoding of these is owned by the device wrapper, the library only names the
/// operation and its inputs.
#[derive(Debug)]
pub enum VendorCommand<'a> {
    MultiAdvSetAdvertisingParameters {
        advertising_handle: u8,
        interval_min: u16,
        interval_max: u16,
        advertising_type: u8,
        own_address: &'a BluetoothDeviceAddress,
    },
    MultiAdvSetAdvertisingData {
        advertising_handle: u8,
        data: &'a [u8],
    },
    MultiAdvSetScanResponseData {
        advertising_handle: u8,
        data: &'a [u8],
    },
    MultiAdvSetRandomAddress {
        advertising_handle: u8,
        address: &'a BluetoothDeviceAddress,
    },
    MultiAdvEnable {
        advertising_handle: u8,
        enable: bool,
    },
}

/// The device wrapper
///
/// An implementation talks to one controller and can open each endpoint once. The vendor
/// methods are optional; the defaults report no vendor capabilities.
pub trait HciDevice {
    type Endpoint: HciEndpoint + 'static;

    fn open_command_endpoint(&self) -> Result<Self::Endpoint, Error>;

    fn open_acl_data_endpoint(&self) -> Result<Self::Endpoint, Error>;

    /// Bitset of supported vendor features
    fn get_vendor_features(&self) -> u32 {
        0
    }

    /// Encode a vendor command into a command packet
    fn encode_vendor_command(&self, command: VendorCommand) -> Result<CommandPacket, Error> {
        let _ = command;
        Err(Error::Unsupported("vendor command encoding"))
    }
}

/// An armed timer created through a [`TimerDriver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerHandle(pub(crate) u64);

/// One shot timer scheduling
///
/// Timer callbacks run on the I/O worker, the same context that delivers events, so a
/// callback never races the event handlers it shares state with.
pub trait TimerDriver: Send + Sync {
    /// Arm a one shot timer
    fn schedule(
        &self,
        delay: Duration,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Result<TimerHandle, Error>;

    /// Disarm a timer
    ///
    /// Returns false when the timer already fired (or never existed), in which case its
    /// callback has run or is about to.
    fn cancel(&self, timer: TimerHandle) -> bool;
}

pub type ClosedCallback = Box<dyn FnOnce() + Send>;

/// Owner of the two channels and the I/O worker
///
/// Dropping the transport (or calling [`shutdown`](Transport::shutdown)) tears the data
/// channel down before the command channel, then stops the worker.
pub struct Transport {
    command_channel: Arc<CommandChannel>,
    acl_data_channel: Arc<AclDataChannel>,
    #[cfg(unix)]
    worker: Option<unix::IoWorker>,
}

impl Transport {
    /// Bring the transport up over a device
    ///
    /// Opens both endpoints, spawns the I/O worker, and wires the channel to channel routing
    /// (completed packet accounting, buffer overflow signaling). The `closed_callback` runs
    /// once if either endpoint is closed from the controller side.
    #[cfg(unix)]
    pub fn initialize<D>(device: &D, closed_callback: ClosedCallback) -> Result<Transport, Error>
    where
        D: HciDevice,
        D::Endpoint: std::os::unix::io::AsRawFd,
    {
        let command_endpoint = Arc::new(device.open_command_endpoint()?);
        let acl_endpoint = Arc::new(device.open_acl_data_endpoint()?);

        let worker_builder = unix::IoWorkerBuilder::new()?;

        let timers: Arc<dyn TimerDriver> = worker_builder.get_timer_driver();

        let command_channel =
            Arc::new(CommandChannel::new(command_endpoint.clone(), timers.clone()));

        let acl_data_channel = Arc::new(AclDataChannel::new(acl_endpoint.clone()));

        AclDataChannel::attach(&acl_data_channel, &command_channel);

        let closed_callback = shared_closed_callback(closed_callback);

        {
            let closed = closed_callback.clone();
            let channel = command_channel.clone();

            // data buffer overflow leaves the controller accounting undefined, treat it the
            // same as losing the endpoint
            channel.add_internal_event_handler(
                crate::hci::events::Events::DataBufferOverflow,
                move |_| {
                    log::error!("controller reported a data buffer overflow");
                    run_closed_callback(&closed);
                    crate::hci::command_channel::EventHandlerVerdict::Continue
                },
            );
        }

        let worker = worker_builder.spawn(
            command_endpoint,
            acl_endpoint,
            command_channel.clone(),
            acl_data_channel.clone(),
            closed_callback,
        )?;

        Ok(Transport { command_channel, acl_data_channel, worker: Some(worker) })
    }

    pub fn get_command_channel(&self) -> &Arc<CommandChannel> {
        &self.command_channel
    }

    pub fn get_acl_data_channel(&self) -> &Arc<AclDataChannel> {
        &self.acl_data_channel
    }

    /// Tear the transport down
    ///
    /// The data channel stops first so no queued packet races the command channel's own
    /// teardown, then the worker is joined.
    pub fn shutdown(mut self) {
        self.shutdown_in_place();
    }

    fn shutdown_in_place(&mut self) {
        self.acl_data_channel.shut_down();
        self.command_channel.shut_down();

        #[cfg(unix)]
        {
            if let Some(worker) = self.worker.take() {
                worker.stop();
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown_in_place();
    }
}

pub(crate) type SharedClosedCallback = Arc<Mutex<Option<ClosedCallback>>>;

pub(crate) fn shared_closed_callback(callback: ClosedCallback) -> SharedClosedCallback {
    Arc::new(Mutex::new(Some(callback)))
}

/// Run the supervisor closed callback, at most once
pub(crate) fn run_closed_callback(callback: &SharedClosedCallback) {
    let taken = callback.lock().expect("closed callback lock poisoned").take();

    if let Some(callback) = taken {
        callback();
    }
}
