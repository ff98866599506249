//! Controller events
//!
//! Events are parsed exactly once, at the framing boundary, into the [`EventsData`] sum type.
//! Everything past that point dispatches on the enum instead of re-reading raw bytes. Parse
//! failures carry a `String` describing the malformed field; the command channel logs and
//! drops those per the transport error policy.

use crate::hci::common::{ConnectionHandle, LEAddressType, LinkType, Role};
use crate::hci::error::Error;
use crate::hci::EventPacket;
use crate::BluetoothDeviceAddress;

/// Event code of the vendor debug event
///
/// The multi-advertising vendor extension delivers its advertising state change subevents
/// under this code.
pub const VENDOR_DEBUG_EVENT_CODE: u8 = 0xFF;

macro_rules! need {
    ( $packet:ident, $size:expr, $what:expr ) => {
        if $packet.len() < $size {
            return Err(format!("event truncated within {}", $what));
        }
    };
}

/// "Chews off" the first byte of `$packet`, or with a size the first `$size` bytes as a slice
macro_rules! chew {
    ( $packet:ident, $size:expr ) => {{
        let chewed = &$packet[..($size as usize)];
        $packet = &$packet[($size as usize)..];
        chewed
    }};
    ( $packet:ident ) => {{
        let chewed_byte = $packet[0];
        $packet = &$packet[1..];
        chewed_byte
    }};
}

macro_rules! chew_u16 {
    ( $packet:ident ) => {{
        let chewed = <u16>::from_le_bytes([$packet[0], $packet[1]]);
        $packet = &$packet[2..];
        chewed
    }};
}

macro_rules! chew_u64 {
    ( $packet:ident ) => {{
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&$packet[..8]);
        $packet = &$packet[8..];
        <u64>::from_le_bytes(raw)
    }};
}

macro_rules! chew_baddr {
    ( $packet:ident ) => {{
        let mut address: BluetoothDeviceAddress = [0u8; 6];
        address.copy_from_slice(&$packet[..6]);
        $packet = &$packet[6..];
        address
    }};
}

macro_rules! chew_handle {
    ( $packet:ident ) => {
        ConnectionHandle::try_from(chew_u16!($packet) & 0xFFF)
            .map_err(|e| format!("bad connection handle, {}", e))?
    };
}

/// The events this library understands
///
/// The variants carry no data, they identify an event the way the wire does so that handler
/// registrations can be keyed on them. [`EventsData`] is the parsed counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Events {
    DisconnectionComplete,
    EncryptionChange,
    CommandComplete,
    CommandStatus,
    HardwareError,
    NumberOfCompletedPackets,
    DataBufferOverflow,
    EncryptionKeyRefreshComplete,
    LEMeta(LEMeta),
    VendorDebug,
}

impl Events {
    pub fn get_event_code(&self) -> u8 {
        match *self {
            Events::DisconnectionComplete => 0x05,
            Events::EncryptionChange => 0x08,
            Events::CommandComplete => 0x0E,
            Events::CommandStatus => 0x0F,
            Events::HardwareError => 0x10,
            Events::NumberOfCompletedPackets => 0x13,
            Events::DataBufferOverflow => 0x1A,
            Events::EncryptionKeyRefreshComplete => 0x30,
            Events::LEMeta(_) => 0x3E,
            Events::VendorDebug => VENDOR_DEBUG_EVENT_CODE,
        }
    }

    /// Check if this event has channel-internal semantics
    ///
    /// Reserved events drive the transport itself and are never deliverable to user
    /// registered handlers.
    pub fn is_reserved(&self) -> bool {
        match *self {
            Events::CommandComplete
            | Events::CommandStatus
            | Events::NumberOfCompletedPackets
            | Events::DisconnectionComplete
            | Events::EncryptionChange
            | Events::EncryptionKeyRefreshComplete
            | Events::HardwareError
            | Events::DataBufferOverflow => true,
            // The LE meta event code itself is reserved, subscriptions go to subevents
            Events::LEMeta(_) => false,
            // consumed by the multi advertising vendor back end
            Events::VendorDebug => true,
        }
    }
}

/// LE meta subevents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LEMeta {
    ConnectionComplete,
    AdvertisingReport,
    LongTermKeyRequest,
    EnhancedConnectionComplete,
}

impl LEMeta {
    pub fn get_subevent_code(&self) -> u8 {
        match *self {
            LEMeta::ConnectionComplete => 0x01,
            LEMeta::AdvertisingReport => 0x02,
            LEMeta::LongTermKeyRequest => 0x05,
            LEMeta::EnhancedConnectionComplete => 0x0A,
        }
    }

    pub fn try_from_subevent_code(raw: u8) -> Result<Self, String> {
        match raw {
            0x01 => Ok(LEMeta::ConnectionComplete),
            0x02 => Ok(LEMeta::AdvertisingReport),
            0x05 => Ok(LEMeta::LongTermKeyRequest),
            0x0A => Ok(LEMeta::EnhancedConnectionComplete),
            _ => Err(format!("unknown LE meta subevent: 0x{:02X}", raw)),
        }
    }
}

/// The level of encryption on a link after an encryption change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionLevel {
    Off,
    E0,
    AESCCM,
}

/// The raw encryption enabled field of the encryption change event
///
/// The meaning of the non zero values differs between BR/EDR and LE links, so interpretation
/// is deferred until the link type is known.
#[derive(Debug, Clone, Copy)]
pub struct EncryptionEnabled {
    raw: u8,
}

impl EncryptionEnabled {
    pub fn get_for_le(&self) -> EncryptionLevel {
        if self.raw == 0x01 {
            EncryptionLevel::AESCCM
        } else {
            EncryptionLevel::Off
        }
    }

    pub fn get_for_br_edr(&self) -> EncryptionLevel {
        match self.raw {
            0x01 => EncryptionLevel::E0,
            0x02 => EncryptionLevel::AESCCM,
            _ => EncryptionLevel::Off,
        }
    }

    pub fn is_enabled_for(&self, link_type: LinkType) -> bool {
        if link_type.is_le() {
            self.get_for_le() != EncryptionLevel::Off
        } else {
            self.get_for_br_edr() != EncryptionLevel::Off
        }
    }
}

impl From<u8> for EncryptionEnabled {
    fn from(raw: u8) -> Self {
        EncryptionEnabled { raw }
    }
}

#[derive(Debug, Clone)]
pub struct DisconnectionCompleteData {
    pub status: Error,
    pub connection_handle: ConnectionHandle,
    pub reason: Error,
}

impl DisconnectionCompleteData {
    fn try_from_packet(mut packet: &[u8]) -> Result<Self, String> {
        need!(packet, 4, "disconnection complete");

        Ok(DisconnectionCompleteData {
            status: Error::from(chew!(packet)),
            connection_handle: chew_handle!(packet),
            reason: Error::from(chew!(packet)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EncryptionChangeData {
    pub status: Error,
    pub connection_handle: ConnectionHandle,
    pub encryption_enabled: EncryptionEnabled,
}

impl EncryptionChangeData {
    fn try_from_packet(mut packet: &[u8]) -> Result<Self, String> {
        need!(packet, 4, "encryption change");

        Ok(EncryptionChangeData {
            status: Error::from(chew!(packet)),
            connection_handle: chew_handle!(packet),
            encryption_enabled: EncryptionEnabled::from(chew!(packet)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CommandCompleteData {
    pub number_of_hci_command_packets: u8,
    /// `None` when the event only updates the credit window
    pub command_opcode: Option<u16>,
    /// The return parameter bytes, including the status byte when the command has one
    pub return_parameter: Vec<u8>,
}

impl CommandCompleteData {
    fn try_from_packet(mut packet: &[u8]) -> Result<Self, String> {
        need!(packet, 3, "command complete");

        let number_of_hci_command_packets = chew!(packet);

        let opcode = chew_u16!(packet);

        Ok(CommandCompleteData {
            number_of_hci_command_packets,
            command_opcode: if opcode == crate::hci::opcodes::NO_OP { None } else { Some(opcode) },
            return_parameter: packet.to_vec(),
        })
    }

    /// The status byte of the return parameter, when there is one
    pub fn get_status(&self) -> Option<Error> {
        self.return_parameter.first().map(|&raw| Error::from(raw))
    }
}

#[derive(Debug, Clone)]
pub struct CommandStatusData {
    pub status: Error,
    pub number_of_hci_command_packets: u8,
    pub command_opcode: Option<u16>,
}

impl CommandStatusData {
    fn try_from_packet(mut packet: &[u8]) -> Result<Self, String> {
        need!(packet, 4, "command status");

        let status = Error::from(chew!(packet));

        let number_of_hci_command_packets = chew!(packet);

        let opcode = chew_u16!(packet);

        Ok(CommandStatusData {
            status,
            number_of_hci_command_packets,
            command_opcode: if opcode == crate::hci::opcodes::NO_OP { None } else { Some(opcode) },
        })
    }
}

#[derive(Debug, Clone)]
pub struct HardwareErrorData {
    pub hardware_error: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct NumberOfCompletedPacketsPair {
    pub connection_handle: ConnectionHandle,
    pub completed_packets: u16,
}

#[derive(Debug, Clone)]
pub struct NumberOfCompletedPacketsData {
    pub completed_packets: Vec<NumberOfCompletedPacketsPair>,
}

impl NumberOfCompletedPacketsData {
    fn try_from_packet(mut packet: &[u8]) -> Result<Self, String> {
        need!(packet, 1, "number of completed packets");

        let count = chew!(packet) as usize;

        need!(packet, count * 4, "number of completed packets");

        let mut completed_packets = Vec::with_capacity(count);

        for _ in 0..count {
            completed_packets.push(NumberOfCompletedPacketsPair {
                connection_handle: chew_handle!(packet),
                completed_packets: chew_u16!(packet),
            });
        }

        Ok(NumberOfCompletedPacketsData { completed_packets })
    }
}

#[derive(Debug, Clone)]
pub struct DataBufferOverflowData {
    pub link_type: LinkType,
}

#[derive(Debug, Clone)]
pub struct EncryptionKeyRefreshCompleteData {
    pub status: Error,
    pub connection_handle: ConnectionHandle,
}

impl EncryptionKeyRefreshCompleteData {
    fn try_from_packet(mut packet: &[u8]) -> Result<Self, String> {
        need!(packet, 3, "encryption key refresh complete");

        Ok(EncryptionKeyRefreshCompleteData {
            status: Error::from(chew!(packet)),
            connection_handle: chew_handle!(packet),
        })
    }
}

#[derive(Debug, Clone)]
pub struct LEConnectionCompleteData {
    pub status: Error,
    pub connection_handle: ConnectionHandle,
    pub role: Role,
    pub peer_address_type: LEAddressType,
    pub peer_address: BluetoothDeviceAddress,
    pub connection_interval: u16,
    pub connection_latency: u16,
    pub supervision_timeout: u16,
}

impl LEConnectionCompleteData {
    fn try_from_packet(mut packet: &[u8]) -> Result<Self, String> {
        need!(packet, 18, "LE connection complete");

        let status = Error::from(chew!(packet));
        let connection_handle = chew_handle!(packet);
        let role = Role::try_from(chew!(packet))?;
        let peer_address_type = LEAddressType::try_from(chew!(packet))?;
        let peer_address = chew_baddr!(packet);
        let connection_interval = chew_u16!(packet);
        let connection_latency = chew_u16!(packet);
        let supervision_timeout = chew_u16!(packet);

        // the final byte is the central clock accuracy, which nothing above consumes

        Ok(LEConnectionCompleteData {
            status,
            connection_handle,
            role,
            peer_address_type,
            peer_address,
            connection_interval,
            connection_latency,
            supervision_timeout,
        })
    }

    /// Get the negotiated connection parameters
    ///
    /// `None` when the completion status was an error, the parameter fields carry nothing
    /// meaningful then.
    pub fn get_connection_parameters(&self) -> Option<crate::hci::common::LEConnectionParameters> {
        use crate::hci::common::{ConnectionInterval, LEConnectionParameters, SupervisionTimeout};

        if !self.status.is_ok() {
            return None;
        }

        let interval = ConnectionInterval::try_from_raw(self.connection_interval).ok()?;
        let timeout = SupervisionTimeout::try_from_raw(self.supervision_timeout).ok()?;

        LEConnectionParameters::try_new(interval, self.connection_latency, timeout).ok()
    }
}

/// The PDU type of one advertising report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisingEventType {
    ConnectableAndScannableUndirected,
    ConnectableDirected,
    ScannableUndirected,
    NonConnectableUndirected,
    ScanResponse,
}

impl AdvertisingEventType {
    fn try_from(raw: u8) -> Result<Self, String> {
        use self::AdvertisingEventType::*;

        match raw {
            0x00 => Ok(ConnectableAndScannableUndirected),
            0x01 => Ok(ConnectableDirected),
            0x02 => Ok(ScannableUndirected),
            0x03 => Ok(NonConnectableUndirected),
            0x04 => Ok(ScanResponse),
            _ => Err(format!("unknown advertising event type: {}", raw)),
        }
    }

    /// Check if a peer advertising with this PDU type accepts a connection request
    pub fn is_connectable(&self) -> bool {
        use self::AdvertisingEventType::*;

        match *self {
            ConnectableAndScannableUndirected | ConnectableDirected => true,
            _ => false,
        }
    }

    /// Check if a peer advertising with this PDU type answers an active scan request
    pub fn is_scannable(&self) -> bool {
        use self::AdvertisingEventType::*;

        match *self {
            ConnectableAndScannableUndirected | ScannableUndirected => true,
            _ => false,
        }
    }
}

/// One report within a LE advertising report event
#[derive(Debug, Clone)]
pub struct LEAdvertisingReport {
    pub event_type: AdvertisingEventType,
    pub address_type: LEAddressType,
    pub address: BluetoothDeviceAddress,
    pub data: Vec<u8>,
    pub rssi: i8,
}

#[derive(Debug, Clone)]
pub struct LEAdvertisingReportData {
    pub reports: Vec<LEAdvertisingReport>,
}

impl LEAdvertisingReportData {
    fn try_from_packet(mut packet: &[u8]) -> Result<Self, String> {
        need!(packet, 1, "LE advertising report");

        let count = chew!(packet) as usize;

        let mut reports = Vec::with_capacity(count);

        for _ in 0..count {
            need!(packet, 9, "LE advertising report entry");

            let event_type = AdvertisingEventType::try_from(chew!(packet))?;
            let address_type = LEAddressType::try_from(chew!(packet))?;
            let address = chew_baddr!(packet);
            let data_len = chew!(packet) as usize;

            need!(packet, data_len + 1, "LE advertising report data");

            let data = chew!(packet, data_len).to_vec();
            let rssi = chew!(packet) as i8;

            reports.push(LEAdvertisingReport { event_type, address_type, address, data, rssi });
        }

        Ok(LEAdvertisingReportData { reports })
    }
}

#[derive(Debug, Clone)]
pub struct LELongTermKeyRequestData {
    pub connection_handle: ConnectionHandle,
    pub random_number: u64,
    pub encryption_diversifier: u16,
}

impl LELongTermKeyRequestData {
    fn try_from_packet(mut packet: &[u8]) -> Result<Self, String> {
        need!(packet, 12, "LE long term key request");

        Ok(LELongTermKeyRequestData {
            connection_handle: chew_handle!(packet),
            random_number: chew_u64!(packet),
            encryption_diversifier: chew_u16!(packet),
        })
    }
}

/// Vendor debug event payload
///
/// The first byte of a vendor debug event is treated as a subevent code, everything after is
/// left raw for the vendor aware consumer (the multi-advertising back end).
#[derive(Debug, Clone)]
pub struct VendorDebugData {
    pub subevent_code: u8,
    pub payload: Vec<u8>,
}

impl VendorDebugData {
    fn try_from_packet(mut packet: &[u8]) -> Result<Self, String> {
        need!(packet, 1, "vendor debug event");

        Ok(VendorDebugData {
            subevent_code: chew!(packet),
            payload: packet.to_vec(),
        })
    }
}

/// An event parsed into its typed form
#[derive(Debug, Clone)]
pub enum EventsData {
    DisconnectionComplete(DisconnectionCompleteData),
    EncryptionChange(EncryptionChangeData),
    CommandComplete(CommandCompleteData),
    CommandStatus(CommandStatusData),
    HardwareError(HardwareErrorData),
    NumberOfCompletedPackets(NumberOfCompletedPacketsData),
    DataBufferOverflow(DataBufferOverflowData),
    EncryptionKeyRefreshComplete(EncryptionKeyRefreshCompleteData),
    LEConnectionComplete(LEConnectionCompleteData),
    LEAdvertisingReport(LEAdvertisingReportData),
    LELongTermKeyRequest(LELongTermKeyRequestData),
    VendorDebug(VendorDebugData),
}

impl EventsData {
    /// Parse a framed event packet
    ///
    /// # Errors
    /// The event code (or LE subevent code) is not one this library understands, or a field of
    /// the payload is truncated or out of range. Callers log and drop such packets.
    pub fn try_from_packet(packet: &EventPacket) -> Result<Self, String> {
        let mut parameter: &[u8] = packet.get_parameter();

        match packet.get_event_code() {
            0x05 => DisconnectionCompleteData::try_from_packet(parameter)
                .map(EventsData::DisconnectionComplete),
            0x08 => EncryptionChangeData::try_from_packet(parameter).map(EventsData::EncryptionChange),
            0x0E => CommandCompleteData::try_from_packet(parameter).map(EventsData::CommandComplete),
            0x0F => CommandStatusData::try_from_packet(parameter).map(EventsData::CommandStatus),
            0x10 => {
                need!(parameter, 1, "hardware error");

                Ok(EventsData::HardwareError(HardwareErrorData { hardware_error: parameter[0] }))
            }
            0x13 => NumberOfCompletedPacketsData::try_from_packet(parameter)
                .map(EventsData::NumberOfCompletedPackets),
            0x1A => {
                need!(parameter, 1, "data buffer overflow");

                Ok(EventsData::DataBufferOverflow(DataBufferOverflowData {
                    link_type: LinkType::try_from(parameter[0])?,
                }))
            }
            0x30 => EncryptionKeyRefreshCompleteData::try_from_packet(parameter)
                .map(EventsData::EncryptionKeyRefreshComplete),
            0x3E => {
                need!(parameter, 1, "LE meta event");

                let subevent_code = chew!(parameter);

                match LEMeta::try_from_subevent_code(subevent_code)? {
                    LEMeta::ConnectionComplete | LEMeta::EnhancedConnectionComplete => {
                        LEConnectionCompleteData::try_from_packet(parameter)
                            .map(EventsData::LEConnectionComplete)
                    }
                    LEMeta::AdvertisingReport => LEAdvertisingReportData::try_from_packet(parameter)
                        .map(EventsData::LEAdvertisingReport),
                    LEMeta::LongTermKeyRequest => LELongTermKeyRequestData::try_from_packet(parameter)
                        .map(EventsData::LELongTermKeyRequest),
                }
            }
            VENDOR_DEBUG_EVENT_CODE => {
                VendorDebugData::try_from_packet(parameter).map(EventsData::VendorDebug)
            }
            unknown => Err(format!("unknown event code: 0x{:02X}", unknown)),
        }
    }

    /// Get the variant-less identification of this event
    pub fn get_event_name(&self) -> Events {
        match *self {
            EventsData::DisconnectionComplete(_) => Events::DisconnectionComplete,
            EventsData::EncryptionChange(_) => Events::EncryptionChange,
            EventsData::CommandComplete(_) => Events::CommandComplete,
            EventsData::CommandStatus(_) => Events::CommandStatus,
            EventsData::HardwareError(_) => Events::HardwareError,
            EventsData::NumberOfCompletedPackets(_) => Events::NumberOfCompletedPackets,
            EventsData::DataBufferOverflow(_) => Events::DataBufferOverflow,
            EventsData::EncryptionKeyRefreshComplete(_) => Events::EncryptionKeyRefreshComplete,
            EventsData::LEConnectionComplete(_) => Events::LEMeta(LEMeta::ConnectionComplete),
            EventsData::LEAdvertisingReport(_) => Events::LEMeta(LEMeta::AdvertisingReport),
            EventsData::LELongTermKeyRequest(_) => Events::LEMeta(LEMeta::LongTermKeyRequest),
            EventsData::VendorDebug(_) => Events::VendorDebug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(code: u8, parameter: &[u8]) -> EventPacket {
        let mut raw = vec![code, parameter.len() as u8];
        raw.extend_from_slice(parameter);
        EventPacket::from_packet(&raw).unwrap()
    }

    #[test]
    fn command_complete_parse() {
        let event = frame(0x0E, &[2, 0x0C, 0x20, 0x00]);

        match EventsData::try_from_packet(&event).unwrap() {
            EventsData::CommandComplete(data) => {
                assert_eq!(data.number_of_hci_command_packets, 2);
                assert_eq!(data.command_opcode, Some(0x200C));
                assert_eq!(data.get_status(), Some(Error::NoError));
            }
            other => panic!("parsed wrong event: {:?}", other),
        }
    }

    #[test]
    fn command_complete_quota_only() {
        let event = frame(0x0E, &[1, 0x00, 0x00]);

        match EventsData::try_from_packet(&event).unwrap() {
            EventsData::CommandComplete(data) => {
                assert_eq!(data.command_opcode, None);
                assert_eq!(data.get_status(), None);
            }
            other => panic!("parsed wrong event: {:?}", other),
        }
    }

    #[test]
    fn number_of_completed_packets_parse() {
        let event = frame(0x13, &[2, 0x01, 0x00, 0x03, 0x00, 0x02, 0x00, 0x01, 0x00]);

        match EventsData::try_from_packet(&event).unwrap() {
            EventsData::NumberOfCompletedPackets(data) => {
                assert_eq!(data.completed_packets.len(), 2);
                assert_eq!(data.completed_packets[0].connection_handle.get_raw_handle(), 1);
                assert_eq!(data.completed_packets[0].completed_packets, 3);
                assert_eq!(data.completed_packets[1].connection_handle.get_raw_handle(), 2);
                assert_eq!(data.completed_packets[1].completed_packets, 1);
            }
            other => panic!("parsed wrong event: {:?}", other),
        }
    }

    #[test]
    fn truncated_event_is_an_error() {
        let event = frame(0x05, &[0x00, 0x01]);

        assert!(EventsData::try_from_packet(&event).is_err());
    }

    #[test]
    fn advertising_report_parse() {
        let event = frame(
            0x3E,
            &[
                0x02, // subevent: advertising report
                2,    // two reports
                0x00, 0x00, 1, 2, 3, 4, 5, 6, 3, 0x01, 0x02, 0x03, 0x0F, // ADV_IND
                0x04, 0x00, 1, 2, 3, 4, 5, 6, 2, 0xAA, 0xBB, 0x11, // SCAN_RSP
            ],
        );

        match EventsData::try_from_packet(&event).unwrap() {
            EventsData::LEAdvertisingReport(data) => {
                assert_eq!(data.reports.len(), 2);

                let adv = &data.reports[0];
                assert!(adv.event_type.is_connectable() && adv.event_type.is_scannable());
                assert_eq!(adv.data, vec![0x01, 0x02, 0x03]);
                assert_eq!(adv.rssi, 0x0F);

                let rsp = &data.reports[1];
                assert_eq!(rsp.event_type, AdvertisingEventType::ScanResponse);
                assert_eq!(rsp.data, vec![0xAA, 0xBB]);
                assert_eq!(rsp.rssi, 0x11);
            }
            other => panic!("parsed wrong event: {:?}", other),
        }
    }

    #[test]
    fn le_connection_complete_parse() {
        let event = frame(
            0x3E,
            &[
                0x01, // subevent: connection complete
                0x00, // status: success
                0x2A, 0x00, // handle
                0x00, // role: central
                0x00, // peer address type: public
                6, 5, 4, 3, 2, 1, // peer address
                0x18, 0x00, // interval
                0x00, 0x00, // latency
                0x48, 0x00, // supervision timeout
                0x00, // clock accuracy
            ],
        );

        match EventsData::try_from_packet(&event).unwrap() {
            EventsData::LEConnectionComplete(data) => {
                assert!(data.status.is_ok());
                assert_eq!(data.connection_handle.get_raw_handle(), 0x2A);
                assert_eq!(data.role, Role::Central);
                assert_eq!(data.peer_address, [6, 5, 4, 3, 2, 1]);
                assert!(data.get_connection_parameters().is_some());
            }
            other => panic!("parsed wrong event: {:?}", other),
        }
    }
}
