//! Logical links and their encryption state
//!
//! A [`Connection`] exclusively owns one controller link: dropping it tears the link down.
//! Cleanup of the controller side state (unregistering from the data channel and reclaiming
//! buffer slots) is driven by the disconnection complete event through a detached handler
//! that holds only the handle and the channels, so it keeps working when the event arrives
//! after the `Connection` itself is gone.

use std::sync::{Arc, Mutex};

use crate::hci::acl::AclDataChannel;
use crate::hci::cmds::{le as le_cmds, link_control, status_params};
use crate::hci::command_channel::{CommandChannel, EventHandlerId, EventHandlerVerdict, INVALID_TRANSACTION_ID};
use crate::hci::common::{ConnectionHandle, LEConnectionParameters, LinkType, Role};
use crate::hci::error::Error;
use crate::hci::events::{Events, EventsData, LEMeta};
use crate::BluetoothDeviceAddress;

pub use crate::hci::cmds::link_control::DisconnectReason;

/// Smallest BR/EDR encryption key accepted after an encryption change
pub const MIN_ENCRYPTION_KEY_SIZE: u8 = 7;

/// A LE long term key with the identifiers the peer presents when asking for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LongTermKey {
    pub value: u128,
    pub rand: u64,
    pub ediv: u16,
}

/// A BR/EDR link key together with its HCI key type
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BrEdrLinkKey {
    pub value: [u8; 16],
    pub key_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    WaitingForDisconnectionComplete,
    Disconnected,
}

type EncryptionChangeCallback = Box<dyn FnMut(Result<bool, Error>) + Send>;
type PeerDisconnectCallback = Box<dyn FnOnce(ConnectionHandle, Error) + Send>;

/// State shared with the link's event handlers
///
/// The handlers outlive the `Connection`, so everything they touch lives here behind an
/// `Arc`.
struct LinkShared {
    state: ConnectionState,
    long_term_key: Option<LongTermKey>,
    link_key: Option<BrEdrLinkKey>,
    encryption_change_callback: Option<EncryptionChangeCallback>,
    peer_disconnect_callback: Option<PeerDisconnectCallback>,
}

/// One controller link
pub struct Connection {
    handle: ConnectionHandle,
    local_address: BluetoothDeviceAddress,
    peer_address: BluetoothDeviceAddress,
    role: Role,
    link_type: LinkType,
    parameters: Option<LEConnectionParameters>,
    shared: Arc<Mutex<LinkShared>>,
    channel: Arc<CommandChannel>,
    /// Handlers torn down with the connection; the disconnection handler is not among them
    scoped_handlers: Vec<EventHandlerId>,
}

impl Connection {
    /// Take ownership of a link
    ///
    /// Registers the link with the data channel and installs the event handlers that drive
    /// the link's lifetime and encryption state.
    pub fn new(
        handle: ConnectionHandle,
        local_address: BluetoothDeviceAddress,
        peer_address: BluetoothDeviceAddress,
        role: Role,
        link_type: LinkType,
        parameters: Option<LEConnectionParameters>,
        channel: &Arc<CommandChannel>,
        acl: &Arc<AclDataChannel>,
    ) -> Connection {
        acl.register_link(handle, link_type);

        let shared = Arc::new(Mutex::new(LinkShared {
            state: ConnectionState::Connected,
            long_term_key: None,
            link_key: None,
            encryption_change_callback: None,
            peer_disconnect_callback: None,
        }));

        install_disconnection_handler(handle, channel, acl, &shared);

        let mut scoped_handlers = Vec::new();

        scoped_handlers.push(install_encryption_change_handler(
            handle,
            link_type,
            channel,
            &shared,
        ));

        scoped_handlers.push(install_key_refresh_handler(handle, channel, &shared));

        if link_type.is_le() {
            scoped_handlers.push(install_ltk_request_handler(handle, channel, &shared));
        }

        Connection {
            handle,
            local_address,
            peer_address,
            role,
            link_type,
            parameters,
            shared,
            channel: channel.clone(),
            scoped_handlers,
        }
    }

    pub fn get_handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn get_local_address(&self) -> BluetoothDeviceAddress {
        self.local_address
    }

    pub fn get_peer_address(&self) -> BluetoothDeviceAddress {
        self.peer_address
    }

    pub fn get_role(&self) -> Role {
        self.role
    }

    pub fn get_link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn get_parameters(&self) -> Option<LEConnectionParameters> {
        self.parameters
    }

    pub fn get_state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Store the LE long term key used for encryption and LTK request replies
    pub fn set_long_term_key(&self, key: LongTermKey) {
        self.lock().long_term_key = Some(key);
    }

    /// Store the BR/EDR link key
    pub fn set_bredr_link_key(&self, key: BrEdrLinkKey) {
        self.lock().link_key = Some(key);
    }

    /// Set the callback reporting the final outcome of every encryption change
    pub fn set_encryption_change_callback<C>(&self, callback: C)
    where
        C: FnMut(Result<bool, Error>) + Send + 'static,
    {
        self.lock().encryption_change_callback = Some(Box::new(callback));
    }

    /// Set the callback run when the peer tears the link down
    pub fn set_peer_disconnect_callback<C>(&self, callback: C)
    where
        C: FnOnce(ConnectionHandle, Error) + Send + 'static,
    {
        self.lock().peer_disconnect_callback = Some(Box::new(callback));
    }

    /// Ask the controller to terminate the link
    ///
    /// Idempotent; the wire only ever sees one disconnect per link.
    pub fn disconnect(&self, reason: DisconnectReason) {
        send_disconnect(&self.channel, &self.shared, self.handle, reason);
    }

    /// Begin encrypting the link
    ///
    /// For LE links this requires the central role and a stored long term key; for BR/EDR a
    /// stored link key. Returns false when a requirement is missing or the submission was
    /// refused; the eventual outcome arrives through the encryption change callback.
    pub fn start_encryption(&self) -> bool {
        let packet = if self.link_type.is_le() {
            if self.role != Role::Central {
                log::warn!("LE encryption can only be started from the central role");
                return false;
            }

            match self.lock().long_term_key {
                Some(key) => le_cmds::start_encryption(self.handle, key.rand, key.ediv, key.value),
                None => {
                    log::warn!("no long term key for link {:#05X}", self.handle.get_raw_handle());
                    return false;
                }
            }
        } else {
            match self.lock().link_key {
                Some(_) => link_control::set_connection_encryption(self.handle, true),
                None => {
                    log::warn!("no link key for link {:#05X}", self.handle.get_raw_handle());
                    return false;
                }
            }
        };

        let id = self.channel.send_command_with_completion(
            packet,
            |_, _| (),
            Events::CommandStatus,
        );

        id != INVALID_TRANSACTION_ID
    }

    fn lock(&self) -> std::sync::MutexGuard<LinkShared> {
        self.shared.lock().expect("link state lock poisoned")
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for &id in self.scoped_handlers.iter() {
            self.channel.remove_event_handler(id);
        }

        send_disconnect(
            &self.channel,
            &self.shared,
            self.handle,
            DisconnectReason::RemoteUserTerminatedConnection,
        );
    }
}

/// Issue the disconnect command once, tracking the state transition
fn send_disconnect(
    channel: &Arc<CommandChannel>,
    shared: &Arc<Mutex<LinkShared>>,
    handle: ConnectionHandle,
    reason: DisconnectReason,
) {
    {
        let mut shared = shared.lock().expect("link state lock poisoned");

        if shared.state != ConnectionState::Connected {
            return;
        }

        shared.state = ConnectionState::WaitingForDisconnectionComplete;
    }

    log::info!("disconnecting link {:#05X}: {:?}", handle.get_raw_handle(), reason);

    channel.send_command_with_completion(
        link_control::disconnect(handle, reason),
        |_, _| (),
        Events::CommandStatus,
    );
}

/// The detached handler driving controller side cleanup
///
/// Captures only the handle, the channels and the shared link state, never the `Connection`.
/// Removes itself once its link's disconnection completes so a reused handle belongs to the
/// next link's handler.
fn install_disconnection_handler(
    handle: ConnectionHandle,
    channel: &Arc<CommandChannel>,
    acl: &Arc<AclDataChannel>,
    shared: &Arc<Mutex<LinkShared>>,
) {
    let acl = acl.clone();
    let shared = shared.clone();

    channel.add_internal_event_handler(Events::DisconnectionComplete, move |event| {
        let data = match event {
            EventsData::DisconnectionComplete(data) if data.connection_handle == handle => data,
            _ => return EventHandlerVerdict::Continue,
        };

        log::info!(
            "link {:#05X} disconnected: {}",
            handle.get_raw_handle(),
            data.reason
        );

        acl.unregister_link(handle);
        acl.clear_controller_packet_count(handle);

        let peer_initiated_callback = {
            let mut shared = shared.lock().expect("link state lock poisoned");

            let peer_initiated = shared.state == ConnectionState::Connected;

            shared.state = ConnectionState::Disconnected;

            if peer_initiated {
                shared.peer_disconnect_callback.take()
            } else {
                None
            }
        };

        if let Some(callback) = peer_initiated_callback {
            callback(handle, data.reason);
        }

        EventHandlerVerdict::Remove
    });
}

fn install_encryption_change_handler(
    handle: ConnectionHandle,
    link_type: LinkType,
    channel: &Arc<CommandChannel>,
    shared: &Arc<Mutex<LinkShared>>,
) -> EventHandlerId {
    let weak_channel = Arc::downgrade(channel);
    let shared = shared.clone();

    channel.add_internal_event_handler(Events::EncryptionChange, move |event| {
        let data = match event {
            EventsData::EncryptionChange(data) if data.connection_handle == handle => data,
            _ => return EventHandlerVerdict::Continue,
        };

        let channel = match weak_channel.upgrade() {
            Some(channel) => channel,
            None => return EventHandlerVerdict::Remove,
        };

        if !data.status.is_ok() {
            send_disconnect(&channel, &shared, handle, DisconnectReason::AuthenticationFailure);
            report_encryption_change(&shared, Err(data.status));

            return EventHandlerVerdict::Continue;
        }

        let enabled = data.encryption_enabled.is_enabled_for(link_type);

        if link_type.is_le() || !enabled {
            report_encryption_change(&shared, Ok(enabled));

            return EventHandlerVerdict::Continue;
        }

        // BR/EDR links must prove the negotiated key is long enough before the link is
        // treated as encrypted
        validate_key_size(handle, &channel, &shared);

        EventHandlerVerdict::Continue
    })
}

/// Issue read encryption key size and judge the result
fn validate_key_size(
    handle: ConnectionHandle,
    channel: &Arc<CommandChannel>,
    shared: &Arc<Mutex<LinkShared>>,
) {
    let weak_channel = Arc::downgrade(channel);
    let shared = shared.clone();

    let id = channel.send_command(
        status_params::read_encryption_key_size(handle),
        move |_, event| {
            let raw = match event {
                EventsData::CommandComplete(data) => &data.return_parameter,
                _ => return,
            };

            let channel = match weak_channel.upgrade() {
                Some(channel) => channel,
                None => return,
            };

            match status_params::key_size_from_return_parameter(raw) {
                Ok(size) if size >= MIN_ENCRYPTION_KEY_SIZE => {
                    report_encryption_change(&shared, Ok(true));
                }
                Ok(size) => {
                    log::warn!(
                        "link {:#05X} encryption key of {} octets is below the minimum of {}",
                        handle.get_raw_handle(),
                        size,
                        MIN_ENCRYPTION_KEY_SIZE
                    );

                    send_disconnect(&channel, &shared, handle, DisconnectReason::AuthenticationFailure);
                    report_encryption_change(&shared, Err(Error::InsufficientSecurity));
                }
                Err(status) => {
                    send_disconnect(&channel, &shared, handle, DisconnectReason::AuthenticationFailure);
                    report_encryption_change(&shared, Err(status));
                }
            }
        },
    );

    if id == INVALID_TRANSACTION_ID {
        log::error!("could not submit read encryption key size");
    }
}

fn install_key_refresh_handler(
    handle: ConnectionHandle,
    channel: &Arc<CommandChannel>,
    shared: &Arc<Mutex<LinkShared>>,
) -> EventHandlerId {
    let shared = shared.clone();

    channel.add_internal_event_handler(Events::EncryptionKeyRefreshComplete, move |event| {
        if let EventsData::EncryptionKeyRefreshComplete(data) = event {
            if data.connection_handle == handle {
                let result = if data.status.is_ok() { Ok(true) } else { Err(data.status) };

                report_encryption_change(&shared, result);
            }
        }

        EventHandlerVerdict::Continue
    })
}

fn install_ltk_request_handler(
    handle: ConnectionHandle,
    channel: &Arc<CommandChannel>,
    shared: &Arc<Mutex<LinkShared>>,
) -> EventHandlerId {
    let weak_channel = Arc::downgrade(channel);
    let shared = shared.clone();

    channel.add_le_meta_event_handler(LEMeta::LongTermKeyRequest, move |event| {
        let data = match event {
            EventsData::LELongTermKeyRequest(data) if data.connection_handle == handle => data,
            _ => return EventHandlerVerdict::Continue,
        };

        let channel = match weak_channel.upgrade() {
            Some(channel) => channel,
            None => return EventHandlerVerdict::Remove,
        };

        let stored = shared.lock().expect("link state lock poisoned").long_term_key;

        let reply = match stored {
            Some(key)
                if key.rand == data.random_number
                    && key.ediv == data.encryption_diversifier =>
            {
                le_cmds::long_term_key_request_reply(handle, key.value)
            }
            _ => {
                log::info!(
                    "no matching long term key for link {:#05X}, rejecting",
                    handle.get_raw_handle()
                );

                le_cmds::long_term_key_request_negative_reply(handle)
            }
        };

        channel.send_command(reply, |_, _| ());

        EventHandlerVerdict::Continue
    })
}

fn report_encryption_change(shared: &Arc<Mutex<LinkShared>>, result: Result<bool, Error>) {
    let mut shared = shared.lock().expect("link state lock poisoned");

    match shared.encryption_change_callback.as_mut() {
        Some(callback) => callback(result),
        None => log::info!("encryption change with no callback registered: {:?}", result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::acl::{AclDataChannel, DataBufferInfo, PacketPriority};
    use crate::hci::{AclBroadcastFlag, AclPacketBoundary, EventPacket, HciAclData};
    use crate::test_util::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        channel: Arc<CommandChannel>,
        acl: Arc<AclDataChannel>,
        cmd_endpoint: Arc<FakeEndpoint>,
        acl_endpoint: Arc<FakeEndpoint>,
    }

    fn fixture() -> Fixture {
        let cmd_endpoint = FakeEndpoint::new();
        let acl_endpoint = FakeEndpoint::new();
        let timers = FakeTimerDriver::new();

        let channel = Arc::new(CommandChannel::new(
            cmd_endpoint.clone() as Arc<dyn crate::transport::HciEndpoint>,
            timers as Arc<dyn crate::transport::TimerDriver>,
        ));

        let acl =
            Arc::new(AclDataChannel::new(acl_endpoint.clone() as Arc<dyn crate::transport::HciEndpoint>));

        AclDataChannel::attach(&acl, &channel);

        acl.initialize(DataBufferInfo::new(1024, 4), None);

        // a generous credit window so commands flow freely in these tests
        channel.receive_event_packet(&command_complete_quota_frame(10));

        Fixture { channel, acl, cmd_endpoint, acl_endpoint }
    }

    fn connection(fixture: &Fixture, raw_handle: u16, role: Role, link_type: LinkType) -> Connection {
        Connection::new(
            ConnectionHandle::try_from(raw_handle).unwrap(),
            [0; 6],
            [1, 2, 3, 4, 5, 6],
            role,
            link_type,
            None,
            &fixture.channel,
            &fixture.acl,
        )
    }

    fn encryption_change_frame(handle: u16, status: u8, enabled: u8) -> EventPacket {
        let handle_bytes = handle.to_le_bytes();

        EventPacket::from_packet(&[0x08, 4, status, handle_bytes[0], handle_bytes[1], enabled])
            .unwrap()
    }

    #[test]
    fn local_disconnect_lifecycle() {
        let fixture = fixture();

        let conn = connection(&fixture, 0x2A, Role::Central, LinkType::LEConnection);

        assert_eq!(conn.get_state(), ConnectionState::Connected);

        conn.disconnect(DisconnectReason::RemoteUserTerminatedConnection);

        assert_eq!(conn.get_state(), ConnectionState::WaitingForDisconnectionComplete);

        // opcode 0x0406, handle 0x2A, reason 0x13
        let sent = fixture.cmd_endpoint.take_sent();

        assert_eq!(&*sent[0], &[0x06, 0x04, 0x03, 0x2A, 0x00, 0x13]);

        // a second disconnect is a no-op on the wire
        conn.disconnect(DisconnectReason::RemoteUserTerminatedConnection);

        assert_eq!(fixture.cmd_endpoint.sent_count(), 0);

        fixture.channel.receive_event_packet(&command_status_frame(0x00, 10, 0x0406));
        fixture.channel.receive_event_packet(&disconnection_complete_frame(0x2A, 0x16));

        assert_eq!(conn.get_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn drop_sends_disconnect() {
        let fixture = fixture();

        drop(connection(&fixture, 0x2A, Role::Central, LinkType::LEConnection));

        let sent = fixture.cmd_endpoint.take_sent();

        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..2], &[0x06, 0x04]);
    }

    #[test]
    fn cleanup_runs_after_connection_is_gone() {
        let fixture = fixture();

        let handle = ConnectionHandle::try_from(0x2A).unwrap();

        {
            let conn = connection(&fixture, 0x2A, Role::Central, LinkType::LEConnection);

            // occupy controller slots
            assert!(fixture.acl.send_packet(
                HciAclData::new(
                    handle,
                    AclPacketBoundary::FirstNonFlushable,
                    AclBroadcastFlag::NoBroadcast,
                    Box::from(&[0u8][..]),
                ),
                0x40,
                PacketPriority::Low,
            ));

            conn.disconnect(DisconnectReason::RemoteUserTerminatedConnection);
        }

        assert_eq!(fixture.acl_endpoint.take_sent().len(), 1);

        // the connection object is gone, the detached handler still runs the cleanup
        fixture.channel.receive_event_packet(&disconnection_complete_frame(0x2A, 0x16));

        // the handle can be registered again and the controller slot was reclaimed
        fixture.acl.register_link(handle, LinkType::LEConnection);

        assert!(fixture.acl.send_packet(
            HciAclData::new(
                handle,
                AclPacketBoundary::FirstNonFlushable,
                AclBroadcastFlag::NoBroadcast,
                Box::from(&[0u8][..]),
            ),
            0x40,
            PacketPriority::Low,
        ));

        assert_eq!(fixture.acl_endpoint.sent_count(), 1);
    }

    #[test]
    fn peer_disconnect_runs_callback() {
        let fixture = fixture();

        let conn = connection(&fixture, 0x2A, Role::Peripheral, LinkType::LEConnection);

        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked_clone = invoked.clone();

        conn.set_peer_disconnect_callback(move |handle, reason| {
            assert_eq!(handle.get_raw_handle(), 0x2A);
            assert_eq!(reason, Error::RemoteUserTerminatedConnection);
            invoked_clone.fetch_add(1, Ordering::SeqCst);
        });

        fixture.channel.receive_event_packet(&disconnection_complete_frame(0x2A, 0x13));

        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(conn.get_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn le_start_encryption_requirements() {
        let fixture = fixture();

        let peripheral = connection(&fixture, 0x01, Role::Peripheral, LinkType::LEConnection);

        peripheral.set_long_term_key(LongTermKey { value: 1, rand: 2, ediv: 3 });

        assert!(!peripheral.start_encryption());

        let central = connection(&fixture, 0x02, Role::Central, LinkType::LEConnection);

        // no key yet
        assert!(!central.start_encryption());

        central.set_long_term_key(LongTermKey { value: 1, rand: 2, ediv: 3 });

        fixture.cmd_endpoint.take_sent();

        assert!(central.start_encryption());

        let sent = fixture.cmd_endpoint.take_sent();

        assert_eq!(sent.len(), 1);
        // LE start encryption opcode 0x2019
        assert_eq!(&sent[0][..2], &[0x19, 0x20]);
    }

    #[test]
    fn le_encryption_change_reports() {
        let fixture = fixture();

        let conn = connection(&fixture, 0x2A, Role::Central, LinkType::LEConnection);

        let reports = Arc::new(Mutex::new(Vec::new()));
        let reports_clone = reports.clone();

        conn.set_encryption_change_callback(move |result| {
            reports_clone.lock().unwrap().push(result);
        });

        fixture.channel.process_event(
            &crate::hci::events::EventsData::try_from_packet(&encryption_change_frame(0x2A, 0x00, 0x01))
                .unwrap(),
        );

        assert_eq!(*reports.lock().unwrap(), vec![Ok(true)]);
    }

    #[test]
    fn bredr_key_size_validation_rejects_short_keys() {
        let fixture = fixture();

        let conn = connection(&fixture, 0x0B, Role::Central, LinkType::ACLConnection);

        let reports = Arc::new(Mutex::new(Vec::new()));
        let reports_clone = reports.clone();

        conn.set_encryption_change_callback(move |result| {
            reports_clone.lock().unwrap().push(result);
        });

        fixture.cmd_endpoint.take_sent();

        fixture.channel.receive_event_packet(&encryption_change_frame(0x0B, 0x00, 0x01));

        // the key size read goes out: opcode 0x1408
        let sent = fixture.cmd_endpoint.take_sent();

        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..2], &[0x08, 0x14]);

        // command complete: status ok, handle, key size 6
        let complete =
            EventPacket::from_packet(&[0x0E, 7, 10, 0x08, 0x14, 0x00, 0x0B, 0x00, 6]).unwrap();

        fixture.channel.receive_event_packet(&complete);

        assert_eq!(*reports.lock().unwrap(), vec![Err(Error::InsufficientSecurity)]);

        // the link is being torn down with authentication failure
        let sent = fixture.cmd_endpoint.take_sent();

        assert_eq!(sent.len(), 1);
        assert_eq!(&*sent[0], &[0x06, 0x04, 0x03, 0x0B, 0x00, 0x05]);
    }

    #[test]
    fn bredr_key_size_validation_accepts_long_keys() {
        let fixture = fixture();

        let conn = connection(&fixture, 0x0B, Role::Central, LinkType::ACLConnection);

        let reports = Arc::new(Mutex::new(Vec::new()));
        let reports_clone = reports.clone();

        conn.set_encryption_change_callback(move |result| {
            reports_clone.lock().unwrap().push(result);
        });

        fixture.channel.receive_event_packet(&encryption_change_frame(0x0B, 0x00, 0x01));

        let complete =
            EventPacket::from_packet(&[0x0E, 7, 10, 0x08, 0x14, 0x00, 0x0B, 0x00, 7]).unwrap();

        fixture.channel.receive_event_packet(&complete);

        assert_eq!(*reports.lock().unwrap(), vec![Ok(true)]);
        assert_eq!(conn.get_state(), ConnectionState::Connected);
    }

    #[test]
    fn encryption_change_error_disconnects() {
        let fixture = fixture();

        let conn = connection(&fixture, 0x2A, Role::Central, LinkType::LEConnection);

        let reports = Arc::new(Mutex::new(Vec::new()));
        let reports_clone = reports.clone();

        conn.set_encryption_change_callback(move |result| {
            reports_clone.lock().unwrap().push(result);
        });

        fixture.cmd_endpoint.take_sent();

        fixture.channel.receive_event_packet(&encryption_change_frame(0x2A, 0x3D, 0x00));

        assert_eq!(
            *reports.lock().unwrap(),
            vec![Err(Error::ConnectionTerminatedDueToMicFailure)]
        );

        let sent = fixture.cmd_endpoint.take_sent();

        assert_eq!(&*sent[0], &[0x06, 0x04, 0x03, 0x2A, 0x00, 0x05]);
    }

    #[test]
    fn ltk_request_replies() {
        let fixture = fixture();

        let conn = connection(&fixture, 0x2A, Role::Peripheral, LinkType::LEConnection);

        conn.set_long_term_key(LongTermKey { value: 0xABCD, rand: 0x11, ediv: 0x22 });

        fixture.cmd_endpoint.take_sent();

        let matching = {
            let mut raw = vec![0x3E, 13, 0x05, 0x2A, 0x00];
            raw.extend_from_slice(&0x11u64.to_le_bytes());
            raw.extend_from_slice(&0x22u16.to_le_bytes());
            EventPacket::from_packet(&raw).unwrap()
        };

        fixture.channel.receive_event_packet(&matching);

        let sent = fixture.cmd_endpoint.take_sent();

        // LTK request reply opcode 0x201A
        assert_eq!(&sent[0][..2], &[0x1A, 0x20]);

        fixture.channel.receive_event_packet(&command_complete_frame(10, 0x201A, 0x00));

        let mismatched = {
            let mut raw = vec![0x3E, 13, 0x05, 0x2A, 0x00];
            raw.extend_from_slice(&0x99u64.to_le_bytes());
            raw.extend_from_slice(&0x22u16.to_le_bytes());
            EventPacket::from_packet(&raw).unwrap()
        };

        fixture.channel.receive_event_packet(&mismatched);

        let sent = fixture.cmd_endpoint.take_sent();

        // negative reply opcode 0x201B
        assert_eq!(&sent[0][..2], &[0x1B, 0x20]);
    }
}
