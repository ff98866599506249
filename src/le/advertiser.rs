//! The LE advertising lifecycle
//!
//! One workflow drives three HCI command flavors: the legacy single-set commands, the 5.0
//! extended advertising sets, and the pre-5.0 multi advertising vendor extension. The
//! back-ends only build packets (and keep the address to advertising handle bookkeeping);
//! the front end owns sequencing, validation, the connect callback table and the operation
//! FIFO that serializes overlapping start and stop requests.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::conn::Connection;
use crate::hci::acl::AclDataChannel;
use crate::hci::cmds::le as le_cmds;
use crate::hci::command_channel::{CommandChannel, EventHandlerVerdict};
use crate::hci::common::{
    AdvertisingInterval, ConnectionHandle, LEConnectionParameters, LinkType, Role,
};
use crate::hci::error::Error;
use crate::hci::events::{Events, EventsData};
use crate::hci::runner::{SequenceError, SequentialCommandRunner};
use crate::hci::CommandPacket;
use crate::le::adv_data::AdvertisingDataBlock;
use crate::le::LocalAddress;
use crate::transport::VendorCommand;
use crate::BluetoothDeviceAddress;

/// Cap on concurrently advertised sets, regardless of what the controller reports
pub const MAX_ADVERTISING_SETS: u8 = 16;

/// Why an advertising operation failed
#[derive(Debug, Clone, PartialEq)]
pub enum AdvertisingError {
    AdvertisingDataTooLong,
    ScanResponseTooLong,
    AdvertisingHandlesExhausted,
    /// The requested option set cannot be expressed by this back-end
    NotSupported,
    /// The underlying command sequence failed
    Sequence(SequenceError),
}

impl fmt::Display for AdvertisingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AdvertisingError::AdvertisingDataTooLong => write!(f, "advertising data too long"),
            AdvertisingError::ScanResponseTooLong => write!(f, "scan response data too long"),
            AdvertisingError::AdvertisingHandlesExhausted => {
                write!(f, "no free advertising handles")
            }
            AdvertisingError::NotSupported => write!(f, "not supported by this controller"),
            AdvertisingError::Sequence(e) => write!(f, "{}", e),
        }
    }
}

/// Requested advertising interval bounds
#[derive(Debug, Clone, Copy)]
pub struct AdvertisingIntervalRange {
    min: AdvertisingInterval,
    max: AdvertisingInterval,
}

impl AdvertisingIntervalRange {
    /// # Error
    /// The minimum is greater than the maximum.
    pub fn try_new(min: AdvertisingInterval, max: AdvertisingInterval) -> Result<Self, &'static str> {
        if min.get_raw_val() <= max.get_raw_val() {
            Ok(AdvertisingIntervalRange { min, max })
        } else {
            Err("minimum interval is greater than the maximum")
        }
    }

    pub fn get_min(&self) -> AdvertisingInterval {
        self.min
    }

    pub fn get_max(&self) -> AdvertisingInterval {
        self.max
    }
}

impl Default for AdvertisingIntervalRange {
    fn default() -> Self {
        AdvertisingIntervalRange {
            min: AdvertisingInterval::default(),
            max: AdvertisingInterval::default(),
        }
    }
}

/// Caller choices for one advertisement
#[derive(Debug, Clone)]
pub struct AdvertisingOptions {
    pub interval: AdvertisingIntervalRange,
    /// Advertise without any address (extended advertising only)
    pub anonymous: bool,
    /// Flags AD structure prepended to the advertising data
    pub flags: Option<u8>,
    pub include_tx_power_level: bool,
}

impl Default for AdvertisingOptions {
    fn default() -> Self {
        AdvertisingOptions {
            interval: AdvertisingIntervalRange::default(),
            anonymous: false,
            flags: Some(crate::le::adv_data::flags::LE_GENERAL_DISCOVERABLE_MODE),
            include_tx_power_level: false,
        }
    }
}

/// The shape of an advertisement, derived from what the caller provided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisingType {
    NonConnectable,
    Scannable,
    Connectable,
}

/// Inputs for a back-end's start sequence
pub struct StartParameters<'a> {
    pub advertising_data: &'a [u8],
    pub scan_response: &'a [u8],
    pub advertising_type: AdvertisingType,
    pub interval: AdvertisingIntervalRange,
    pub anonymous: bool,
    pub include_tx_power: bool,
}

/// Packet building for one advertising command flavor
pub trait AdvertiserBackend: Send {
    /// Largest advertising (or scan response) block this flavor accepts
    fn max_data_length(&self) -> usize;

    /// The flavor has no native way to include the tx power level, it must be read up front
    /// and patched into the data
    fn needs_tx_power_read(&self) -> bool {
        false
    }

    /// Build the command sequence bringing advertising up at `address`
    fn build_start(
        &mut self,
        address: LocalAddress,
        params: &StartParameters,
    ) -> Result<Vec<CommandPacket>, AdvertisingError>;

    /// Build the command sequence tearing advertising down at `address`
    fn build_stop(&mut self, address: BluetoothDeviceAddress) -> Vec<CommandPacket>;

    /// Release whatever `build_start` allocated for a start that failed
    fn abort_start(&mut self, address: BluetoothDeviceAddress) {
        let _ = address;
    }

    /// Map an advertising set identifier from a connection event to its local address
    fn address_for_set(&self, set_id: u8) -> Option<BluetoothDeviceAddress> {
        let _ = set_id;
        None
    }
}

/// Bidirectional map between advertised addresses and 8 bit advertising handles
///
/// Handles are allocated first-free and may be reused after removal.
pub struct AdvertisingHandleMap {
    capacity: u8,
    by_handle: BTreeMap<u8, BluetoothDeviceAddress>,
}

impl AdvertisingHandleMap {
    /// The protocol ceiling for an advertising handle value plus one
    pub const MAX_CAPACITY: u8 = 0xF0;

    pub fn new(capacity: u8) -> Self {
        AdvertisingHandleMap {
            capacity: capacity.min(Self::MAX_CAPACITY),
            by_handle: BTreeMap::new(),
        }
    }

    /// Get the handle mapped to an address, allocating one on first use
    ///
    /// Returns `None` when every handle is taken.
    pub fn get_or_allocate(&mut self, address: BluetoothDeviceAddress) -> Option<u8> {
        if let Some(handle) = self.handle_for(address) {
            return Some(handle);
        }

        let free = (0..self.capacity).find(|handle| !self.by_handle.contains_key(handle))?;

        self.by_handle.insert(free, address);

        Some(free)
    }

    pub fn handle_for(&self, address: BluetoothDeviceAddress) -> Option<u8> {
        self.by_handle
            .iter()
            .find(|(_, &mapped)| mapped == address)
            .map(|(&handle, _)| handle)
    }

    pub fn address_for(&self, handle: u8) -> Option<BluetoothDeviceAddress> {
        self.by_handle.get(&handle).copied()
    }

    pub fn remove_address(&mut self, address: BluetoothDeviceAddress) {
        if let Some(handle) = self.handle_for(address) {
            self.by_handle.remove(&handle);
        }
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }
}

pub type ConnectionCallback = Box<dyn FnOnce(Connection) + Send>;
type ResultCallback = Box<dyn FnOnce(Result<(), AdvertisingError>) + Send>;
type QueuedOperation = Box<dyn FnOnce() + Send>;

struct ActiveSet {
    connect_callback: Option<ConnectionCallback>,
}

struct Inner {
    backend: Box<dyn AdvertiserBackend>,
    active: BTreeMap<BluetoothDeviceAddress, ActiveSet>,
    op_queue: VecDeque<QueuedOperation>,
    busy: bool,
    /// A back-end failure raised while a sequence was already running
    pending_start_error: Option<AdvertisingError>,
    /// Advertising sets learned from vendor state change events, keyed by the raw handle of
    /// the connection each produced
    staged_connection_sets: BTreeMap<u16, u8>,
}

/// Driver of the advertising lifecycle over one back-end
///
/// Cloning is shallow; clones share the advertising state.
#[derive(Clone)]
pub struct LowEnergyAdvertiser {
    inner: Arc<Mutex<Inner>>,
    runner: SequentialCommandRunner,
    channel: Arc<CommandChannel>,
    acl: Arc<AclDataChannel>,
}

/// Everything a start operation carries between the tx power read and the main sequence
struct StagedStart {
    address: LocalAddress,
    data: Box<dyn AdvertisingDataBlock>,
    scan_response: Option<Box<dyn AdvertisingDataBlock>>,
    options: AdvertisingOptions,
    advertising_type: AdvertisingType,
}

impl LowEnergyAdvertiser {
    pub fn new(
        channel: Arc<CommandChannel>,
        acl: Arc<AclDataChannel>,
        backend: Box<dyn AdvertiserBackend>,
    ) -> Self {
        LowEnergyAdvertiser {
            inner: Arc::new(Mutex::new(Inner {
                backend,
                active: BTreeMap::new(),
                op_queue: VecDeque::new(),
                busy: false,
                pending_start_error: None,
                staged_connection_sets: BTreeMap::new(),
            })),
            runner: SequentialCommandRunner::new(channel.clone()),
            channel,
            acl,
        }
    }

    /// Advertiser over the legacy single set commands
    pub fn new_legacy(channel: Arc<CommandChannel>, acl: Arc<AclDataChannel>) -> Self {
        Self::new(channel, acl, Box::new(LegacyAdvertiserBackend))
    }

    /// Advertiser over the 5.0 extended advertising sets
    #[cfg(feature = "bluetooth_5_0")]
    pub fn new_extended(
        channel: Arc<CommandChannel>,
        acl: Arc<AclDataChannel>,
        controller_supported_sets: u8,
    ) -> Self {
        Self::new(channel, acl, Box::new(ExtendedAdvertiserBackend::new(controller_supported_sets)))
    }

    /// Advertiser over the multi advertising vendor extension
    ///
    /// `encode` is the device wrapper's vendor command encoder.
    pub fn new_vendor_multi<F>(
        channel: Arc<CommandChannel>,
        acl: Arc<AclDataChannel>,
        encode: F,
        controller_supported_sets: u8,
    ) -> Self
    where
        F: Fn(VendorCommand) -> Result<CommandPacket, crate::transport::Error> + Send + 'static,
    {
        let advertiser = Self::new(
            channel.clone(),
            acl,
            Box::new(VendorMultiAdvertiserBackend::new(Box::new(encode), controller_supported_sets)),
        );

        // the vendor extension announces which set produced a connection through its state
        // change subevent; remember the mapping for the connection handoff
        {
            let advertiser = advertiser.clone();

            channel.add_internal_event_handler(Events::VendorDebug, move |event| {
                if let EventsData::VendorDebug(ref data) = event {
                    if data.subevent_code == vendor::MULTI_ADV_STATE_CHANGE_SUBEVENT {
                        match vendor::parse_state_change(&data.payload) {
                            Ok(change) => {
                                if let Some(handle) = change.connection_handle {
                                    advertiser
                                        .lock()
                                        .staged_connection_sets
                                        .insert(handle.get_raw_handle(), change.advertising_handle);
                                }
                            }
                            Err(e) => log::error!("bad multi advertising state change: {}", e),
                        }
                    }
                }

                EventHandlerVerdict::Continue
            });
        }

        advertiser
    }

    /// Start advertising at an address
    ///
    /// The advertising type is derived from what is provided: a connect callback makes the
    /// advertisement connectable, otherwise a scan response makes it scannable, otherwise it
    /// is non-connectable. Starting again at an address that is already advertising replaces
    /// the advertisement (the old one is disabled first).
    pub fn start_advertising<C>(
        &self,
        address: LocalAddress,
        data: Box<dyn AdvertisingDataBlock>,
        scan_response: Option<Box<dyn AdvertisingDataBlock>>,
        options: AdvertisingOptions,
        connect_callback: Option<ConnectionCallback>,
        result_callback: C,
    ) where
        C: FnOnce(Result<(), AdvertisingError>) + Send + 'static,
    {
        let advertiser = self.clone();
        let result_callback = Box::new(result_callback);

        self.run_or_enqueue(Box::new(move || {
            advertiser.do_start(address, data, scan_response, options, connect_callback, result_callback);
        }));
    }

    /// Stop advertising at one address
    pub fn stop_advertising_at(&self, address: BluetoothDeviceAddress) {
        let advertiser = self.clone();

        self.run_or_enqueue(Box::new(move || {
            advertiser.do_stop(&[address]);
        }));
    }

    /// Stop every advertisement
    ///
    /// Also clears operations still waiting in the FIFO; there is no point starting an
    /// advertisement that is about to be stopped again.
    pub fn stop_advertising(&self) {
        let advertiser = self.clone();

        {
            let mut inner = self.lock();

            inner.op_queue.clear();
        }

        self.run_or_enqueue(Box::new(move || {
            let addresses: Vec<_> = advertiser.lock().active.keys().copied().collect();

            advertiser.do_stop(&addresses);
        }));
    }

    pub fn is_advertising(&self) -> bool {
        !self.lock().active.is_empty()
    }

    pub fn is_advertising_at(&self, address: BluetoothDeviceAddress) -> bool {
        self.lock().active.contains_key(&address)
    }

    /// An inbound connection produced by one of our advertisements
    ///
    /// `advertising_set` carries the set identifier for the extended and vendor flavors; the
    /// legacy flavor has a single set and passes `None`.
    pub fn on_incoming_connection(
        &self,
        handle: ConnectionHandle,
        role: Role,
        peer_address: BluetoothDeviceAddress,
        parameters: Option<LEConnectionParameters>,
        advertising_set: Option<u8>,
    ) {
        let resolved = {
            let mut inner = self.lock();

            // a vendor state change may have already named the set for this handle
            let staged_set = inner.staged_connection_sets.remove(&handle.get_raw_handle());

            let local_address = match advertising_set.or(staged_set) {
                Some(set_id) => inner.backend.address_for_set(set_id),
                None if inner.active.len() == 1 => inner.active.keys().next().copied(),
                None => None,
            };

            match local_address {
                Some(address) => {
                    let callback =
                        inner.active.get_mut(&address).and_then(|set| set.connect_callback.take());

                    Some((address, callback))
                }
                None => None,
            }
        };

        let (local_address, callback) = match resolved {
            Some(resolved) => resolved,
            None => {
                log::warn!("connection for an unknown advertisement, disconnecting");

                // building and dropping the connection sends the disconnect
                drop(self.build_connection(handle, [0; 6], peer_address, role, parameters));

                return;
            }
        };

        let connection = self.build_connection(handle, local_address, peer_address, role, parameters);

        match callback {
            Some(callback) => {
                self.stop_advertising_at(local_address);

                callback(connection);
            }
            None => {
                log::warn!(
                    "advertisement at {:02X?} is not connectable, disconnecting",
                    local_address
                );

                drop(connection);
            }
        }
    }

    fn build_connection(
        &self,
        handle: ConnectionHandle,
        local_address: BluetoothDeviceAddress,
        peer_address: BluetoothDeviceAddress,
        role: Role,
        parameters: Option<LEConnectionParameters>,
    ) -> Connection {
        Connection::new(
            handle,
            local_address,
            peer_address,
            role,
            LinkType::LEConnection,
            parameters,
            &self.channel,
            &self.acl,
        )
    }

    /// Run an operation now, or park it until the current one finishes
    fn run_or_enqueue(&self, operation: QueuedOperation) {
        {
            let mut inner = self.lock();

            if inner.busy {
                inner.op_queue.push_back(operation);
                return;
            }

            inner.busy = true;
        }

        operation();
    }

    /// The running operation finished, start the next queued one
    fn on_operation_complete(&self) {
        let next = {
            let mut inner = self.lock();

            match inner.op_queue.pop_front() {
                Some(operation) => Some(operation),
                None => {
                    inner.busy = false;
                    None
                }
            }
        };

        if let Some(operation) = next {
            operation();
        }
    }

    fn do_start(
        &self,
        address: LocalAddress,
        data: Box<dyn AdvertisingDataBlock>,
        scan_response: Option<Box<dyn AdvertisingDataBlock>>,
        options: AdvertisingOptions,
        connect_callback: Option<ConnectionCallback>,
        result_callback: ResultCallback,
    ) {
        let (max_length, needs_tx_power_read) = {
            let inner = self.lock();

            (inner.backend.max_data_length(), inner.backend.needs_tx_power_read())
        };

        if data.calculate_block_size(options.flags.is_some()) > max_length {
            result_callback(Err(AdvertisingError::AdvertisingDataTooLong));
            self.on_operation_complete();
            return;
        }

        if let Some(scan_response) = scan_response.as_ref() {
            if scan_response.calculate_block_size(false) > max_length {
                result_callback(Err(AdvertisingError::ScanResponseTooLong));
                self.on_operation_complete();
                return;
            }
        }

        let advertising_type = if connect_callback.is_some() {
            AdvertisingType::Connectable
        } else if scan_response.is_some() {
            AdvertisingType::Scannable
        } else {
            AdvertisingType::NonConnectable
        };

        // restarting at an active address begins with a disable of the old advertisement
        {
            let mut inner = self.lock();

            if inner.active.remove(&address.address).is_some() {
                let packets = inner.backend.build_stop(address.address);

                drop(inner);

                for packet in packets {
                    self.runner.queue_command(packet, |_| (), true);
                }
            }
        }

        let staged =
            StagedStart { address, data, scan_response, options, advertising_type };

        if staged.options.include_tx_power_level && needs_tx_power_read {
            // the level must be read first and patched into copies of the data
            let advertiser = self.clone();
            let staged = Arc::new(Mutex::new(Some(staged)));

            self.runner.queue_command(
                le_cmds::read_advertising_channel_tx_power(),
                move |event| {
                    let mut staged = match staged.lock().expect("staged start poisoned").take() {
                        Some(staged) => staged,
                        None => return,
                    };

                    if let EventsData::CommandComplete(data) = event {
                        match le_cmds::tx_power_from_return_parameter(&data.return_parameter) {
                            Ok(power) => {
                                staged.data.set_tx_power(power);

                                if let Some(scan_response) = staged.scan_response.as_mut() {
                                    scan_response.set_tx_power(power);
                                }
                            }
                            Err(e) => log::warn!("tx power read failed, advertising without: {}", e),
                        }
                    }

                    advertiser.queue_start_packets(staged);
                },
                true,
            );
        } else {
            self.queue_start_packets(staged);
        }

        let advertiser = self.clone();

        self.runner.run_commands(move |result| {
            let outcome = {
                let mut inner = advertiser.lock();

                match inner.pending_start_error.take() {
                    Some(e) => Err(e),
                    None => match result {
                        Ok(()) => {
                            inner
                                .active
                                .insert(address.address, ActiveSet { connect_callback });

                            Ok(())
                        }
                        Err(e) => {
                            inner.backend.abort_start(address.address);

                            Err(AdvertisingError::Sequence(e))
                        }
                    },
                }
            };

            result_callback(outcome);

            advertiser.on_operation_complete();
        });
    }

    /// Write the blocks and hand the back-end's start sequence to the runner
    fn queue_start_packets(&self, staged: StagedStart) {
        let advertising_block = write_block(&*staged.data, staged.options.flags);

        let scan_response_block = staged
            .scan_response
            .as_ref()
            .map(|block| write_block(&**block, None))
            .unwrap_or_default();

        let packets = {
            let mut inner = self.lock();

            inner.backend.build_start(
                staged.address,
                &StartParameters {
                    advertising_data: &advertising_block,
                    scan_response: &scan_response_block,
                    advertising_type: staged.advertising_type,
                    interval: staged.options.interval,
                    anonymous: staged.options.anonymous,
                    include_tx_power: staged.options.include_tx_power_level,
                },
            )
        };

        match packets {
            Ok(packets) => {
                for packet in packets {
                    self.runner.queue_command(packet, |_| (), true);
                }
            }
            Err(e) => {
                // the sequence may already be running; park the error for its result handler
                self.lock().pending_start_error = Some(e);
                self.runner.cancel();
            }
        }
    }

    fn do_stop(&self, addresses: &[BluetoothDeviceAddress]) {
        let packets: Vec<CommandPacket> = {
            let mut inner = self.lock();

            let mut packets = Vec::new();

            for &address in addresses {
                if inner.active.remove(&address).is_none() {
                    log::warn!("stop requested for {:02X?}, which is not advertising", address);
                    continue;
                }

                packets.extend(inner.backend.build_stop(address));
            }

            packets
        };

        if packets.is_empty() {
            self.on_operation_complete();
            return;
        }

        for packet in packets {
            self.runner.queue_command(packet, |_| (), true);
        }

        let advertiser = self.clone();

        self.runner.run_commands(move |result| {
            if let Err(e) = result {
                log::error!("stop advertising sequence failed: {}", e);
            }

            advertiser.on_operation_complete();
        });
    }

    fn lock(&self) -> MutexGuard<Inner> {
        self.inner.lock().expect("advertiser lock poisoned")
    }
}

fn write_block(block: &dyn AdvertisingDataBlock, flags: Option<u8>) -> Vec<u8> {
    let mut buffer = vec![0u8; block.calculate_block_size(flags.is_some())];

    let written = block.write_block(&mut buffer, flags);

    buffer.truncate(written);

    buffer
}

/// The legacy single set advertiser
pub struct LegacyAdvertiserBackend;

impl AdvertiserBackend for LegacyAdvertiserBackend {
    fn max_data_length(&self) -> usize {
        le_cmds::MAX_ADVERTISING_DATA_LENGTH
    }

    fn needs_tx_power_read(&self) -> bool {
        true
    }

    fn build_start(
        &mut self,
        address: LocalAddress,
        params: &StartParameters,
    ) -> Result<Vec<CommandPacket>, AdvertisingError> {
        if params.anonymous {
            return Err(AdvertisingError::NotSupported);
        }

        let advertising_type = match params.advertising_type {
            AdvertisingType::Connectable => le_cmds::AdvertisingType::ConnectableAndScannableUndirected,
            AdvertisingType::Scannable => le_cmds::AdvertisingType::ScannableUndirected,
            AdvertisingType::NonConnectable => le_cmds::AdvertisingType::NonConnectableUndirected,
        };

        Ok(vec![
            le_cmds::set_advertising_parameters(&le_cmds::AdvertisingParameters {
                interval_min: params.interval.get_min(),
                interval_max: params.interval.get_max(),
                advertising_type,
                own_address_type: address.own_address_type(),
                channel_map: 0x07,
            }),
            le_cmds::set_advertising_data(params.advertising_data),
            le_cmds::set_scan_response_data(params.scan_response),
            le_cmds::set_advertising_enable(true),
        ])
    }

    fn build_stop(&mut self, _address: BluetoothDeviceAddress) -> Vec<CommandPacket> {
        vec![
            le_cmds::set_advertising_enable(false),
            le_cmds::set_scan_response_data(&[]),
            le_cmds::set_advertising_data(&[]),
        ]
    }
}

/// The 5.0 extended advertising back-end
#[cfg(feature = "bluetooth_5_0")]
pub struct ExtendedAdvertiserBackend {
    handles: AdvertisingHandleMap,
}

#[cfg(feature = "bluetooth_5_0")]
impl ExtendedAdvertiserBackend {
    pub fn new(controller_supported_sets: u8) -> Self {
        ExtendedAdvertiserBackend {
            handles: AdvertisingHandleMap::new(controller_supported_sets.min(MAX_ADVERTISING_SETS)),
        }
    }
}

#[cfg(feature = "bluetooth_5_0")]
impl AdvertiserBackend for ExtendedAdvertiserBackend {
    fn max_data_length(&self) -> usize {
        le_cmds::extended::MAX_EXTENDED_DATA_FRAGMENT_LENGTH
    }

    fn build_start(
        &mut self,
        address: LocalAddress,
        params: &StartParameters,
    ) -> Result<Vec<CommandPacket>, AdvertisingError> {
        use le_cmds::extended::event_properties;

        let advertising_handle = self
            .handles
            .get_or_allocate(address.address)
            .ok_or(AdvertisingError::AdvertisingHandlesExhausted)?;

        let mut properties = event_properties::LEGACY_PDU;

        properties |= match params.advertising_type {
            AdvertisingType::Connectable => {
                event_properties::CONNECTABLE | event_properties::SCANNABLE
            }
            AdvertisingType::Scannable => event_properties::SCANNABLE,
            AdvertisingType::NonConnectable => 0,
        };

        if params.anonymous {
            properties |= event_properties::ANONYMOUS;
        }

        if params.include_tx_power {
            properties |= event_properties::INCLUDE_TX_POWER;
        }

        let mut packets = vec![
            le_cmds::extended::set_extended_advertising_parameters(
                &le_cmds::extended::ExtendedAdvertisingParameters {
                    advertising_handle,
                    event_properties: properties,
                    interval_min: params.interval.get_min(),
                    interval_max: params.interval.get_max(),
                    own_address_type: address.own_address_type(),
                    channel_map: 0x07,
                },
            ),
            le_cmds::extended::set_extended_advertising_data(
                advertising_handle,
                params.advertising_data,
            ),
        ];

        if !params.scan_response.is_empty() {
            packets.push(le_cmds::extended::set_extended_scan_response_data(
                advertising_handle,
                params.scan_response,
            ));
        }

        packets.push(le_cmds::extended::set_extended_advertising_enable(
            true,
            &[advertising_handle],
        ));

        Ok(packets)
    }

    fn build_stop(&mut self, address: BluetoothDeviceAddress) -> Vec<CommandPacket> {
        let advertising_handle = match self.handles.handle_for(address) {
            Some(handle) => handle,
            None => return Vec::new(),
        };

        self.handles.remove_address(address);

        vec![
            le_cmds::extended::set_extended_advertising_enable(false, &[advertising_handle]),
            le_cmds::extended::set_extended_scan_response_data(advertising_handle, &[]),
            le_cmds::extended::set_extended_advertising_data(advertising_handle, &[]),
            le_cmds::extended::remove_advertising_set(advertising_handle),
        ]
    }

    fn abort_start(&mut self, address: BluetoothDeviceAddress) {
        self.handles.remove_address(address);
    }

    fn address_for_set(&self, set_id: u8) -> Option<BluetoothDeviceAddress> {
        self.handles.address_for(set_id)
    }
}

type VendorCommandEncoder =
    Box<dyn Fn(VendorCommand) -> Result<CommandPacket, crate::transport::Error> + Send>;

/// The pre-5.0 multi advertising vendor extension back-end
///
/// Packet encoding belongs to the device wrapper; this back-end only names the operations.
pub struct VendorMultiAdvertiserBackend {
    encode: VendorCommandEncoder,
    handles: AdvertisingHandleMap,
}

impl VendorMultiAdvertiserBackend {
    pub fn new(encode: VendorCommandEncoder, controller_supported_sets: u8) -> Self {
        VendorMultiAdvertiserBackend {
            encode,
            handles: AdvertisingHandleMap::new(controller_supported_sets.min(MAX_ADVERTISING_SETS)),
        }
    }

    fn encode(&self, command: VendorCommand) -> Result<CommandPacket, AdvertisingError> {
        (self.encode)(command).map_err(|e| {
            log::error!("vendor command encoding failed: {}", e);
            AdvertisingError::NotSupported
        })
    }
}

impl AdvertiserBackend for VendorMultiAdvertiserBackend {
    fn max_data_length(&self) -> usize {
        le_cmds::MAX_ADVERTISING_DATA_LENGTH
    }

    fn needs_tx_power_read(&self) -> bool {
        true
    }

    fn build_start(
        &mut self,
        address: LocalAddress,
        params: &StartParameters,
    ) -> Result<Vec<CommandPacket>, AdvertisingError> {
        if params.anonymous {
            return Err(AdvertisingError::NotSupported);
        }

        let advertising_handle = self
            .handles
            .get_or_allocate(address.address)
            .ok_or(AdvertisingError::AdvertisingHandlesExhausted)?;

        let advertising_type = match params.advertising_type {
            AdvertisingType::Connectable => 0x00,
            AdvertisingType::Scannable => 0x02,
            AdvertisingType::NonConnectable => 0x03,
        };

        Ok(vec![
            self.encode(VendorCommand::MultiAdvSetAdvertisingParameters {
                advertising_handle,
                interval_min: params.interval.get_min().get_raw_val(),
                interval_max: params.interval.get_max().get_raw_val(),
                advertising_type,
                own_address: &address.address,
            })?,
            self.encode(VendorCommand::MultiAdvSetAdvertisingData {
                advertising_handle,
                data: params.advertising_data,
            })?,
            self.encode(VendorCommand::MultiAdvSetScanResponseData {
                advertising_handle,
                data: params.scan_response,
            })?,
            self.encode(VendorCommand::MultiAdvEnable { advertising_handle, enable: true })?,
        ])
    }

    fn build_stop(&mut self, address: BluetoothDeviceAddress) -> Vec<CommandPacket> {
        let advertising_handle = match self.handles.handle_for(address) {
            Some(handle) => handle,
            None => return Vec::new(),
        };

        self.handles.remove_address(address);

        let mut packets = Vec::new();

        let encoded = vec![
            (self.encode)(VendorCommand::MultiAdvEnable { advertising_handle, enable: false }),
            (self.encode)(VendorCommand::MultiAdvSetScanResponseData {
                advertising_handle,
                data: &[],
            }),
            (self.encode)(VendorCommand::MultiAdvSetAdvertisingData {
                advertising_handle,
                data: &[],
            }),
        ];

        for result in encoded {
            match result {
                Ok(packet) => packets.push(packet),
                Err(e) => log::error!("vendor command encoding failed during stop: {}", e),
            }
        }

        packets
    }

    fn abort_start(&mut self, address: BluetoothDeviceAddress) {
        self.handles.remove_address(address);
    }

    fn address_for_set(&self, set_id: u8) -> Option<BluetoothDeviceAddress> {
        self.handles.address_for(set_id)
    }
}

/// Parsing for the multi advertising state change vendor subevent
pub mod vendor {
    use super::*;

    /// Subevent code of the advertising state change within the vendor debug event
    pub const MULTI_ADV_STATE_CHANGE_SUBEVENT: u8 = 0x55;

    /// One advertising set stopped, usually because it produced a connection
    #[derive(Debug, Clone, Copy)]
    pub struct MultiAdvStateChange {
        pub advertising_handle: u8,
        pub status: Error,
        pub connection_handle: Option<ConnectionHandle>,
    }

    /// Parse the payload of a [`MULTI_ADV_STATE_CHANGE_SUBEVENT`] vendor debug event
    pub fn parse_state_change(payload: &[u8]) -> Result<MultiAdvStateChange, String> {
        if payload.len() < 4 {
            return Err("multi advertising state change event truncated".to_string());
        }

        let raw_handle = u16::from_le_bytes([payload[2], payload[3]]) & 0xFFF;

        Ok(MultiAdvStateChange {
            advertising_handle: payload[0],
            status: Error::from(payload[1]),
            connection_handle: ConnectionHandle::try_from(raw_handle).ok(),
        })
    }
}
