//! Outbound LE link setup
//!
//! One pending request at a time: obtain the local address (possibly asynchronously), issue
//! the create connection command, and wait for the LE connection complete event under a
//! caller supplied timeout. Cancellation never races the wire; it marks the request and lets
//! the controller's own completion (driven by create connection cancel) end things.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::conn::Connection;
use crate::hci::acl::AclDataChannel;
use crate::hci::cmds::le as le_cmds;
use crate::hci::command_channel::{
    CommandChannel, EventHandlerVerdict, INVALID_TRANSACTION_ID,
};
use crate::hci::common::{
    LEAddressType, LEConnectionParameters, LinkType, ScanInterval, ScanWindow,
};
use crate::hci::error::Error;
use crate::hci::events::{EventsData, LEConnectionCompleteData, LEMeta};
use crate::le::{LocalAddress, LocalAddressDelegate};
use crate::transport::{TimerDriver, TimerHandle};
use crate::BluetoothDeviceAddress;

/// Why a connection request ended without a link
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorError {
    /// The request was cancelled by the caller
    Canceled,
    /// The caller supplied timeout expired
    TimedOut,
    /// The controller reported an error
    Controller(Error),
    /// The command channel refused the submission
    SubmitFailed,
}

pub type ConnectorResult = Result<Connection, ConnectorError>;

type StatusCallback = Box<dyn FnOnce(ConnectorResult) + Send>;
type IncomingDelegate = Box<dyn FnMut(Connection) + Send>;

struct PendingRequest {
    use_accept_list: bool,
    peer_address_type: LEAddressType,
    peer_address: BluetoothDeviceAddress,
    scan_interval: ScanInterval,
    scan_window: ScanWindow,
    initial_parameters: LEConnectionParameters,
    local_address: Option<LocalAddress>,
    initiating: bool,
    canceled: bool,
    timed_out: bool,
    timeout: Duration,
    timeout_timer: Option<TimerHandle>,
    status_callback: Option<StatusCallback>,
}

struct Inner {
    pending: Option<PendingRequest>,
    /// Distinguishes the current request from stale async callbacks of older ones
    request_counter: u64,
    incoming_delegate: Option<IncomingDelegate>,
}

/// Driver of outbound LE connections
///
/// Cloning is shallow; clones share the single pending request slot.
#[derive(Clone)]
pub struct LowEnergyConnector {
    inner: Arc<Mutex<Inner>>,
    channel: Arc<CommandChannel>,
    acl: Arc<AclDataChannel>,
    timers: Arc<dyn TimerDriver>,
    address_delegate: Arc<dyn LocalAddressDelegate>,
}

impl LowEnergyConnector {
    pub fn new(
        channel: Arc<CommandChannel>,
        acl: Arc<AclDataChannel>,
        timers: Arc<dyn TimerDriver>,
        address_delegate: Arc<dyn LocalAddressDelegate>,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            pending: None,
            request_counter: 0,
            incoming_delegate: None,
        }));

        // every LE connection complete funnels through here, whether it answers the pending
        // request or announces an inbound link
        {
            let inner = inner.clone();
            let weak_channel = Arc::downgrade(&channel);
            let acl = acl.clone();
            let timers = timers.clone();

            channel.add_le_meta_event_handler(LEMeta::ConnectionComplete, move |event| {
                if let EventsData::LEConnectionComplete(ref data) = event {
                    match weak_channel.upgrade() {
                        Some(channel) => {
                            handle_connection_complete(&inner, &channel, &acl, &timers, data)
                        }
                        None => return EventHandlerVerdict::Remove,
                    }
                }

                EventHandlerVerdict::Continue
            });
        }

        LowEnergyConnector { inner, channel, acl, timers, address_delegate }
    }

    /// Set the delegate receiving connections this host did not ask for
    pub fn set_incoming_connection_delegate<C>(&self, delegate: C)
    where
        C: FnMut(Connection) + Send + 'static,
    {
        self.lock().incoming_delegate = Some(Box::new(delegate));
    }

    /// Start connecting to a peer
    ///
    /// Returns false when another request is already pending. The status callback fires
    /// exactly once with the established connection or the reason there is none.
    pub fn create_connection<C>(
        &self,
        use_accept_list: bool,
        peer_address_type: LEAddressType,
        peer_address: BluetoothDeviceAddress,
        scan_interval: ScanInterval,
        scan_window: ScanWindow,
        initial_parameters: LEConnectionParameters,
        status_callback: C,
        timeout: Duration,
    ) -> bool
    where
        C: FnOnce(ConnectorResult) + Send + 'static,
    {
        let request_counter = {
            let mut inner = self.lock();

            if inner.pending.is_some() {
                log::warn!("connection request refused, another request is pending");
                return false;
            }

            inner.request_counter += 1;

            inner.pending = Some(PendingRequest {
                use_accept_list,
                peer_address_type,
                peer_address,
                scan_interval,
                scan_window,
                initial_parameters,
                local_address: None,
                initiating: false,
                canceled: false,
                timed_out: false,
                timeout,
                timeout_timer: None,
                status_callback: Some(Box::new(status_callback)),
            });

            inner.request_counter
        };

        let connector = self.clone();

        self.address_delegate.ensure_local_address(Box::new(move |local_address| {
            connector.on_local_address(request_counter, local_address);
        }));

        true
    }

    /// Cancel the pending request
    ///
    /// Idempotent and safe from any thread. If the create connection command is already on
    /// the wire the user visible completion is driven by the controller's unknown connection
    /// identifier error; before that the request completes synchronously.
    pub fn cancel(&self) {
        let callback = {
            let mut inner = self.lock();

            let pending = match inner.pending.as_mut() {
                Some(pending) => pending,
                None => return,
            };

            if pending.canceled {
                return;
            }

            pending.canceled = true;

            if pending.initiating {
                // completion arrives as LE connection complete with unknown connection id
                self.channel.send_command(le_cmds::create_connection_cancel(), |_, _| ());

                None
            } else {
                let callback = pending.status_callback.take();

                if let Some(timer) = pending.timeout_timer.take() {
                    self.timers.cancel(timer);
                }

                inner.pending = None;

                callback
            }
        };

        if let Some(callback) = callback {
            callback(Err(ConnectorError::Canceled));
        }
    }

    /// Whether the stack may rotate the controller's random address right now
    ///
    /// Random address changes are disallowed exactly while a create connection is in flight.
    pub fn allow_random_address_change(&self) -> bool {
        self.lock().pending.as_ref().map(|pending| !pending.initiating).unwrap_or(true)
    }

    pub fn has_pending_request(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// The local address has been resolved, move to the wire
    fn on_local_address(&self, request_counter: u64, local_address: LocalAddress) {
        let callback = {
            let mut inner = self.lock();

            if inner.request_counter != request_counter {
                return;
            }

            let pending = match inner.pending.as_mut() {
                Some(pending) => pending,
                None => return,
            };

            if pending.canceled {
                let callback = pending.status_callback.take();

                inner.pending = None;

                callback.map(|callback| (callback, Err(ConnectorError::Canceled)))
            } else {
                pending.local_address = Some(local_address);

                let packet = le_cmds::create_connection(&le_cmds::CreateConnectionParameters {
                    use_filter_accept_list: pending.use_accept_list,
                    peer_address_type: pending.peer_address_type,
                    peer_address: pending.peer_address,
                    scan_interval: pending.scan_interval,
                    scan_window: pending.scan_window,
                    own_address_type: local_address.own_address_type(),
                    initial_parameters: pending.initial_parameters,
                });

                // the command status only carries early failure, the transaction's real end
                // is the connection complete handled by the static handler
                let connector = self.clone();

                let id = self.channel.send_command_with_completion(
                    packet,
                    move |_, event| {
                        if let EventsData::CommandStatus(data) = event {
                            if !data.status.is_ok() {
                                connector.on_submission_failed(
                                    request_counter,
                                    ConnectorError::Controller(data.status),
                                );
                            }
                        }
                    },
                    crate::hci::events::Events::CommandStatus,
                );

                if id == INVALID_TRANSACTION_ID {
                    let callback = pending.status_callback.take();

                    inner.pending = None;

                    callback.map(|callback| (callback, Err(ConnectorError::SubmitFailed)))
                } else {
                    pending.initiating = true;

                    let connector = self.clone();
                    let timeout = pending.timeout;

                    match self.timers.schedule(
                        timeout,
                        Box::new(move || connector.on_timeout(request_counter)),
                    ) {
                        Ok(timer) => pending.timeout_timer = Some(timer),
                        Err(e) => log::error!("failed to arm connection timeout: {}", e),
                    }

                    None
                }
            }
        };

        if let Some((callback, result)) = callback {
            callback(result);
        }
    }

    /// The create connection command was rejected by the controller
    fn on_submission_failed(&self, request_counter: u64, error: ConnectorError) {
        let callback = {
            let mut inner = self.lock();

            if inner.request_counter != request_counter {
                return;
            }

            let pending = match inner.pending.as_mut() {
                Some(pending) => pending,
                None => return,
            };

            if let Some(timer) = pending.timeout_timer.take() {
                self.timers.cancel(timer);
            }

            let callback = pending.status_callback.take();

            inner.pending = None;

            callback
        };

        if let Some(callback) = callback {
            callback(Err(error));
        }
    }

    /// The caller supplied timeout expired before the controller finished
    fn on_timeout(&self, request_counter: u64) {
        let mut inner = self.lock();

        if inner.request_counter != request_counter {
            return;
        }

        let pending = match inner.pending.as_mut() {
            Some(pending) => pending,
            None => return,
        };

        pending.timed_out = true;
        pending.timeout_timer = None;

        if pending.initiating {
            self.channel.send_command(le_cmds::create_connection_cancel(), |_, _| ());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<Inner> {
        self.inner.lock().expect("connector lock poisoned")
    }
}

/// Route one LE connection complete to the pending request or the incoming delegate
fn handle_connection_complete(
    inner: &Arc<Mutex<Inner>>,
    channel: &Arc<CommandChannel>,
    acl: &Arc<AclDataChannel>,
    timers: &Arc<dyn TimerDriver>,
    data: &LEConnectionCompleteData,
) {
    let mut locked = inner.lock().expect("connector lock poisoned");

    let matches_pending = match locked.pending.as_ref() {
        Some(pending) => {
            pending.initiating
                && (!data.status.is_ok()
                    || pending.use_accept_list
                    || pending.peer_address == data.peer_address)
        }
        None => false,
    };

    if matches_pending {
        let mut pending = match locked.pending.take() {
            Some(pending) => pending,
            None => return,
        };

        if let Some(timer) = pending.timeout_timer.take() {
            timers.cancel(timer);
        }

        let callback = match pending.status_callback.take() {
            Some(callback) => callback,
            None => return,
        };

        drop(locked);

        let result = if data.status.is_ok() {
            Ok(build_connection(
                channel,
                acl,
                pending.local_address.map(|local| local.address).unwrap_or([0; 6]),
                data,
            ))
        } else if data.status == Error::UnknownConnectionIdentifier && pending.canceled {
            Err(ConnectorError::Canceled)
        } else if data.status == Error::UnknownConnectionIdentifier && pending.timed_out {
            Err(ConnectorError::TimedOut)
        } else {
            Err(ConnectorError::Controller(data.status))
        };

        callback(result);

        return;
    }

    // not ours: an inbound link, or noise after a completed request
    if !data.status.is_ok() {
        log::info!("ignoring failed connection complete with no pending request: {}", data.status);
        return;
    }

    let delegate = locked.incoming_delegate.take();

    drop(locked);

    // the connection object is built unlocked, it registers its own handlers
    let connection = build_connection(channel, acl, [0; 6], data);

    match delegate {
        Some(mut delegate) => {
            delegate(connection);

            let mut locked = inner.lock().expect("connector lock poisoned");

            // keep the delegate unless the callback replaced it
            if locked.incoming_delegate.is_none() {
                locked.incoming_delegate = Some(delegate);
            }
        }
        None => {
            log::warn!("incoming connection with no delegate registered, disconnecting");

            // letting the connection destruct sends the disconnect
            drop(connection);
        }
    }
}

fn build_connection(
    channel: &Arc<CommandChannel>,
    acl: &Arc<AclDataChannel>,
    local_address: BluetoothDeviceAddress,
    data: &LEConnectionCompleteData,
) -> Connection {
    Connection::new(
        data.connection_handle,
        local_address,
        data.peer_address,
        data.role,
        LinkType::LEConnection,
        data.get_connection_parameters(),
        channel,
        acl,
    )
}
