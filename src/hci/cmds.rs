//! Command packet builders
//!
//! One builder per HCI command the engines issue. Parameters are packed explicitly into
//! little endian byte vectors; the builders never produce a payload over the command packet
//! size limit, so they all return [`CommandPacket`] directly.
//!
//! Return parameter parsers live next to the builders of the commands that produce them.

use crate::hci::CommandPacket;

pub mod link_control {
    use super::*;
    use crate::hci::common::ConnectionHandle;
    use crate::hci::error::Error;
    use crate::hci::opcodes::{HCICommand, LinkControl};

    /// The error codes accepted as a reason for a disconnect
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DisconnectReason {
        AuthenticationFailure,
        RemoteUserTerminatedConnection,
        RemoteDeviceTerminatedConnectionDueToLowResources,
        RemoteDeviceTerminatedConnectionDueToPowerOff,
        UnsupportedRemoteFeature,
        PairingWithUnitKeyNotSupported,
        UnacceptableConnectionParameters,
    }

    impl DisconnectReason {
        pub fn get_val(&self) -> u8 {
            match *self {
                DisconnectReason::AuthenticationFailure => 0x05,
                DisconnectReason::RemoteUserTerminatedConnection => 0x13,
                DisconnectReason::RemoteDeviceTerminatedConnectionDueToLowResources => 0x14,
                DisconnectReason::RemoteDeviceTerminatedConnectionDueToPowerOff => 0x15,
                DisconnectReason::UnsupportedRemoteFeature => 0x1A,
                DisconnectReason::PairingWithUnitKeyNotSupported => 0x29,
                DisconnectReason::UnacceptableConnectionParameters => 0x3B,
            }
        }

        pub fn try_from_hci_error(error: Error) -> Result<DisconnectReason, &'static str> {
            match error {
                Error::AuthenticationFailure => Ok(DisconnectReason::AuthenticationFailure),
                Error::RemoteUserTerminatedConnection => {
                    Ok(DisconnectReason::RemoteUserTerminatedConnection)
                }
                Error::RemoteDeviceTerminatedConnectionDueToLowResources => {
                    Ok(DisconnectReason::RemoteDeviceTerminatedConnectionDueToLowResources)
                }
                Error::RemoteDeviceTerminatedConnectionDueToPowerOff => {
                    Ok(DisconnectReason::RemoteDeviceTerminatedConnectionDueToPowerOff)
                }
                Error::UnsupportedRemoteFeatureOrUnsupportedLMPFeature => {
                    Ok(DisconnectReason::UnsupportedRemoteFeature)
                }
                Error::PairingWithUnitKeyNotSupported => {
                    Ok(DisconnectReason::PairingWithUnitKeyNotSupported)
                }
                Error::UnacceptableConnectionParameters => {
                    Ok(DisconnectReason::UnacceptableConnectionParameters)
                }
                _ => Err("no disconnect reason for error"),
            }
        }
    }

    pub fn disconnect(handle: ConnectionHandle, reason: DisconnectReason) -> CommandPacket {
        let mut parameter = Vec::with_capacity(3);

        parameter.extend_from_slice(&handle.get_raw_handle().to_le_bytes());
        parameter.push(reason.get_val());

        CommandPacket::new(HCICommand::LinkControl(LinkControl::Disconnect), parameter)
    }

    pub fn set_connection_encryption(handle: ConnectionHandle, enable: bool) -> CommandPacket {
        let mut parameter = Vec::with_capacity(3);

        parameter.extend_from_slice(&handle.get_raw_handle().to_le_bytes());
        parameter.push(enable as u8);

        CommandPacket::new(HCICommand::LinkControl(LinkControl::SetConnectionEncryption), parameter)
    }
}

pub mod controller_baseband {
    use super::*;
    use crate::hci::opcodes::{ControllerAndBaseband, HCICommand};

    pub fn reset() -> CommandPacket {
        CommandPacket::new(HCICommand::ControllerAndBaseband(ControllerAndBaseband::Reset), Vec::new())
    }

    pub fn set_event_mask(mask: u64) -> CommandPacket {
        CommandPacket::new(
            HCICommand::ControllerAndBaseband(ControllerAndBaseband::SetEventMask),
            mask.to_le_bytes().to_vec(),
        )
    }
}

pub mod info_params {
    use super::*;
    use crate::hci::error::Error;
    use crate::hci::opcodes::{HCICommand, InformationParameters};
    use crate::BluetoothDeviceAddress;

    pub fn read_buffer_size() -> CommandPacket {
        CommandPacket::new(
            HCICommand::InformationParameters(InformationParameters::ReadBufferSize),
            Vec::new(),
        )
    }

    pub fn read_bd_addr() -> CommandPacket {
        CommandPacket::new(
            HCICommand::InformationParameters(InformationParameters::ReadBD_ADDR),
            Vec::new(),
        )
    }

    pub fn read_local_version_information() -> CommandPacket {
        CommandPacket::new(
            HCICommand::InformationParameters(InformationParameters::ReadLocalVersionInformation),
            Vec::new(),
        )
    }

    /// Return of the read buffer size command
    #[derive(Debug, Clone, Copy)]
    pub struct BufferSize {
        pub acl_data_packet_length: u16,
        pub total_num_acl_data_packets: u16,
    }

    impl BufferSize {
        /// Parse the return parameter of a command complete for read buffer size
        pub fn try_from_return_parameter(raw: &[u8]) -> Result<Self, Error> {
            if raw.len() < 8 {
                return Err(Error::UnspecifiedError);
            }

            let status = Error::from(raw[0]);

            if !status.is_ok() {
                return Err(status);
            }

            Ok(BufferSize {
                acl_data_packet_length: u16::from_le_bytes([raw[1], raw[2]]),
                total_num_acl_data_packets: u16::from_le_bytes([raw[4], raw[5]]),
            })
        }
    }

    /// Parse the return parameter of a command complete for read BD_ADDR
    pub fn bd_addr_from_return_parameter(raw: &[u8]) -> Result<BluetoothDeviceAddress, Error> {
        if raw.len() < 7 {
            return Err(Error::UnspecifiedError);
        }

        let status = Error::from(raw[0]);

        if !status.is_ok() {
            return Err(status);
        }

        let mut address: BluetoothDeviceAddress = [0; 6];

        address.copy_from_slice(&raw[1..7]);

        Ok(address)
    }
}

pub mod status_params {
    use super::*;
    use crate::hci::common::ConnectionHandle;
    use crate::hci::error::Error;
    use crate::hci::opcodes::{HCICommand, StatusParameters};

    pub fn read_encryption_key_size(handle: ConnectionHandle) -> CommandPacket {
        CommandPacket::new(
            HCICommand::StatusParameters(StatusParameters::ReadEncryptionKeySize),
            handle.get_raw_handle().to_le_bytes().to_vec(),
        )
    }

    /// Parse the return parameter of a command complete for read encryption key size
    pub fn key_size_from_return_parameter(raw: &[u8]) -> Result<u8, Error> {
        if raw.len() < 4 {
            return Err(Error::UnspecifiedError);
        }

        let status = Error::from(raw[0]);

        if !status.is_ok() {
            return Err(status);
        }

        Ok(raw[3])
    }
}

pub mod le {
    use super::*;
    use crate::hci::common::{
        AdvertisingInterval, ConnectionHandle, LEAddressType, LEConnectionParameters, ScanInterval,
        ScanWindow,
    };
    use crate::hci::error::Error;
    use crate::hci::opcodes::{HCICommand, LEController};
    use crate::BluetoothDeviceAddress;

    /// Largest advertising or scan response payload for the legacy commands
    pub const MAX_ADVERTISING_DATA_LENGTH: usize = 31;

    /// Own address type sent with advertising, scanning and connecting commands
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum OwnAddressType {
        PublicDeviceAddress,
        RandomDeviceAddress,
        RpaFromLocalIrkOrPublic,
        RpaFromLocalIrkOrRandom,
    }

    impl OwnAddressType {
        fn into_raw(self) -> u8 {
            match self {
                OwnAddressType::PublicDeviceAddress => 0x00,
                OwnAddressType::RandomDeviceAddress => 0x01,
                OwnAddressType::RpaFromLocalIrkOrPublic => 0x02,
                OwnAddressType::RpaFromLocalIrkOrRandom => 0x03,
            }
        }
    }

    /// The legacy advertising PDU types
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum AdvertisingType {
        ConnectableAndScannableUndirected,
        ConnectableHighDutyCycleDirected,
        ScannableUndirected,
        NonConnectableUndirected,
        ConnectableLowDutyCycleDirected,
    }

    impl AdvertisingType {
        fn into_raw(self) -> u8 {
            match self {
                AdvertisingType::ConnectableAndScannableUndirected => 0x00,
                AdvertisingType::ConnectableHighDutyCycleDirected => 0x01,
                AdvertisingType::ScannableUndirected => 0x02,
                AdvertisingType::NonConnectableUndirected => 0x03,
                AdvertisingType::ConnectableLowDutyCycleDirected => 0x04,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ScanType {
        Passive,
        Active,
    }

    /// The scanner's filter policy
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ScanningFilterPolicy {
        AcceptAll,
        FilterAcceptListOnly,
    }

    impl ScanningFilterPolicy {
        fn into_raw(self) -> u8 {
            match self {
                ScanningFilterPolicy::AcceptAll => 0x00,
                ScanningFilterPolicy::FilterAcceptListOnly => 0x01,
            }
        }
    }

    /// Parameters of the legacy set advertising parameters command
    #[derive(Debug, Clone)]
    pub struct AdvertisingParameters {
        pub interval_min: AdvertisingInterval,
        pub interval_max: AdvertisingInterval,
        pub advertising_type: AdvertisingType,
        pub own_address_type: OwnAddressType,
        /// All three advertising channels
        pub channel_map: u8,
    }

    impl Default for AdvertisingParameters {
        fn default() -> Self {
            AdvertisingParameters {
                interval_min: AdvertisingInterval::default(),
                interval_max: AdvertisingInterval::default(),
                advertising_type: AdvertisingType::ConnectableAndScannableUndirected,
                own_address_type: OwnAddressType::PublicDeviceAddress,
                channel_map: 0x07,
            }
        }
    }

    pub fn set_advertising_parameters(params: &AdvertisingParameters) -> CommandPacket {
        let mut parameter = Vec::with_capacity(15);

        parameter.extend_from_slice(&params.interval_min.get_raw_val().to_le_bytes());
        parameter.extend_from_slice(&params.interval_max.get_raw_val().to_le_bytes());
        parameter.push(params.advertising_type.into_raw());
        parameter.push(params.own_address_type.into_raw());
        parameter.push(0x00); // peer address type, unused without directed advertising
        parameter.extend_from_slice(&[0u8; 6]); // peer address
        parameter.push(params.channel_map);
        parameter.push(0x00); // advertising filter policy: allow all

        CommandPacket::new(HCICommand::LEController(LEController::SetAdvertisingParameters), parameter)
    }

    pub fn read_advertising_channel_tx_power() -> CommandPacket {
        CommandPacket::new(
            HCICommand::LEController(LEController::ReadAdvertisingChannelTxPower),
            Vec::new(),
        )
    }

    /// Parse the return parameter of read advertising channel tx power
    pub fn tx_power_from_return_parameter(raw: &[u8]) -> Result<i8, Error> {
        if raw.len() < 2 {
            return Err(Error::UnspecifiedError);
        }

        let status = Error::from(raw[0]);

        if !status.is_ok() {
            return Err(status);
        }

        Ok(raw[1] as i8)
    }

    /// The data commands carry a fixed 31 byte buffer with a significant length prefix
    fn fixed_data_parameter(data: &[u8]) -> Vec<u8> {
        debug_assert!(data.len() <= MAX_ADVERTISING_DATA_LENGTH);

        let mut parameter = Vec::with_capacity(1 + MAX_ADVERTISING_DATA_LENGTH);

        parameter.push(data.len() as u8);
        parameter.extend_from_slice(data);
        parameter.resize(1 + MAX_ADVERTISING_DATA_LENGTH, 0);

        parameter
    }

    pub fn set_advertising_data(data: &[u8]) -> CommandPacket {
        CommandPacket::new(
            HCICommand::LEController(LEController::SetAdvertisingData),
            fixed_data_parameter(data),
        )
    }

    pub fn set_scan_response_data(data: &[u8]) -> CommandPacket {
        CommandPacket::new(
            HCICommand::LEController(LEController::SetScanResponseData),
            fixed_data_parameter(data),
        )
    }

    pub fn set_advertising_enable(enable: bool) -> CommandPacket {
        CommandPacket::new(
            HCICommand::LEController(LEController::SetAdvertisingEnable),
            vec![enable as u8],
        )
    }

    pub fn set_random_address(address: BluetoothDeviceAddress) -> CommandPacket {
        CommandPacket::new(
            HCICommand::LEController(LEController::SetRandomAddress),
            address.to_vec(),
        )
    }

    pub fn set_scan_parameters(
        scan_type: ScanType,
        interval: ScanInterval,
        window: ScanWindow,
        own_address_type: OwnAddressType,
        filter_policy: ScanningFilterPolicy,
    ) -> CommandPacket {
        let mut parameter = Vec::with_capacity(7);

        parameter.push(match scan_type {
            ScanType::Passive => 0x00,
            ScanType::Active => 0x01,
        });
        parameter.extend_from_slice(&interval.get_raw_val().to_le_bytes());
        parameter.extend_from_slice(&window.get_raw_val().to_le_bytes());
        parameter.push(own_address_type.into_raw());
        parameter.push(filter_policy.into_raw());

        CommandPacket::new(HCICommand::LEController(LEController::SetScanParameters), parameter)
    }

    pub fn set_scan_enable(enable: bool, filter_duplicates: bool) -> CommandPacket {
        CommandPacket::new(
            HCICommand::LEController(LEController::SetScanEnable),
            vec![enable as u8, filter_duplicates as u8],
        )
    }

    /// Parameters of the create connection command
    #[derive(Debug, Clone)]
    pub struct CreateConnectionParameters {
        /// Connect to whoever the filter accept list names instead of `peer_address`
        pub use_filter_accept_list: bool,
        pub peer_address_type: LEAddressType,
        pub peer_address: BluetoothDeviceAddress,
        pub scan_interval: ScanInterval,
        pub scan_window: ScanWindow,
        pub own_address_type: OwnAddressType,
        pub initial_parameters: LEConnectionParameters,
    }

    pub fn create_connection(params: &CreateConnectionParameters) -> CommandPacket {
        let mut parameter = Vec::with_capacity(25);

        parameter.extend_from_slice(&params.scan_interval.get_raw_val().to_le_bytes());
        parameter.extend_from_slice(&params.scan_window.get_raw_val().to_le_bytes());
        parameter.push(params.use_filter_accept_list as u8);
        parameter.push(params.peer_address_type.into_raw());
        parameter.extend_from_slice(&params.peer_address);
        parameter.push(params.own_address_type.into_raw());

        let interval = params.initial_parameters.interval.get_raw_val();

        parameter.extend_from_slice(&interval.to_le_bytes()); // interval min
        parameter.extend_from_slice(&interval.to_le_bytes()); // interval max
        parameter.extend_from_slice(&params.initial_parameters.latency.to_le_bytes());
        parameter
            .extend_from_slice(&params.initial_parameters.supervision_timeout.get_raw_val().to_le_bytes());
        parameter.extend_from_slice(&0u16.to_le_bytes()); // minimum CE length
        parameter.extend_from_slice(&0u16.to_le_bytes()); // maximum CE length

        CommandPacket::new(HCICommand::LEController(LEController::CreateConnection), parameter)
    }

    pub fn create_connection_cancel() -> CommandPacket {
        CommandPacket::new(HCICommand::LEController(LEController::CreateConnectionCancel), Vec::new())
    }

    fn accept_list_parameter(address_type: LEAddressType, address: BluetoothDeviceAddress) -> Vec<u8> {
        let mut parameter = Vec::with_capacity(7);

        parameter.push(address_type.into_raw());
        parameter.extend_from_slice(&address);

        parameter
    }

    pub fn add_device_to_filter_accept_list(
        address_type: LEAddressType,
        address: BluetoothDeviceAddress,
    ) -> CommandPacket {
        CommandPacket::new(
            HCICommand::LEController(LEController::AddDeviceToFilterAcceptList),
            accept_list_parameter(address_type, address),
        )
    }

    pub fn remove_device_from_filter_accept_list(
        address_type: LEAddressType,
        address: BluetoothDeviceAddress,
    ) -> CommandPacket {
        CommandPacket::new(
            HCICommand::LEController(LEController::RemoveDeviceFromFilterAcceptList),
            accept_list_parameter(address_type, address),
        )
    }

    pub fn clear_filter_accept_list() -> CommandPacket {
        CommandPacket::new(HCICommand::LEController(LEController::ClearFilterAcceptList), Vec::new())
    }

    pub fn read_buffer_size() -> CommandPacket {
        CommandPacket::new(HCICommand::LEController(LEController::ReadBufferSize), Vec::new())
    }

    /// Return of the LE read buffer size command
    ///
    /// Both fields zero means the controller has no dedicated LE buffer and the BR/EDR one is
    /// shared.
    #[derive(Debug, Clone, Copy)]
    pub struct LeBufferSize {
        pub data_packet_length: u16,
        pub total_num_data_packets: u8,
    }

    impl LeBufferSize {
        pub fn try_from_return_parameter(raw: &[u8]) -> Result<Self, Error> {
            if raw.len() < 4 {
                return Err(Error::UnspecifiedError);
            }

            let status = Error::from(raw[0]);

            if !status.is_ok() {
                return Err(status);
            }

            Ok(LeBufferSize {
                data_packet_length: u16::from_le_bytes([raw[1], raw[2]]),
                total_num_data_packets: raw[3],
            })
        }
    }

    pub fn start_encryption(
        handle: ConnectionHandle,
        random_number: u64,
        encrypted_diversifier: u16,
        long_term_key: u128,
    ) -> CommandPacket {
        let mut parameter = Vec::with_capacity(28);

        parameter.extend_from_slice(&handle.get_raw_handle().to_le_bytes());
        parameter.extend_from_slice(&random_number.to_le_bytes());
        parameter.extend_from_slice(&encrypted_diversifier.to_le_bytes());
        parameter.extend_from_slice(&long_term_key.to_le_bytes());

        CommandPacket::new(HCICommand::LEController(LEController::StartEncryption), parameter)
    }

    pub fn long_term_key_request_reply(
        handle: ConnectionHandle,
        long_term_key: u128,
    ) -> CommandPacket {
        let mut parameter = Vec::with_capacity(18);

        parameter.extend_from_slice(&handle.get_raw_handle().to_le_bytes());
        parameter.extend_from_slice(&long_term_key.to_le_bytes());

        CommandPacket::new(HCICommand::LEController(LEController::LongTermKeyRequestReply), parameter)
    }

    pub fn long_term_key_request_negative_reply(handle: ConnectionHandle) -> CommandPacket {
        CommandPacket::new(
            HCICommand::LEController(LEController::LongTermKeyRequestNegativeReply),
            handle.get_raw_handle().to_le_bytes().to_vec(),
        )
    }

    #[cfg(feature = "bluetooth_5_0")]
    pub mod extended {
        //! Builders for the 5.0 extended advertising command set

        use super::*;

        /// Largest data payload one extended data command can carry
        pub const MAX_EXTENDED_DATA_FRAGMENT_LENGTH: usize = 251;

        /// Event properties bits for legacy PDU shaped extended advertising
        pub mod event_properties {
            pub const CONNECTABLE: u16 = 1 << 0;
            pub const SCANNABLE: u16 = 1 << 1;
            pub const LEGACY_PDU: u16 = 1 << 4;
            pub const ANONYMOUS: u16 = 1 << 5;
            pub const INCLUDE_TX_POWER: u16 = 1 << 6;
        }

        #[derive(Debug, Clone)]
        pub struct ExtendedAdvertisingParameters {
            pub advertising_handle: u8,
            pub event_properties: u16,
            pub interval_min: AdvertisingInterval,
            pub interval_max: AdvertisingInterval,
            pub own_address_type: OwnAddressType,
            pub channel_map: u8,
        }

        pub fn set_extended_advertising_parameters(
            params: &ExtendedAdvertisingParameters,
        ) -> CommandPacket {
            let mut parameter = Vec::with_capacity(25);

            parameter.push(params.advertising_handle);
            parameter.extend_from_slice(&params.event_properties.to_le_bytes());

            // the extended intervals are 3 bytes wide
            let min = params.interval_min.get_raw_val() as u32;
            let max = params.interval_max.get_raw_val() as u32;

            parameter.extend_from_slice(&min.to_le_bytes()[..3]);
            parameter.extend_from_slice(&max.to_le_bytes()[..3]);

            parameter.push(params.channel_map);
            parameter.push(params.own_address_type.into_raw());
            parameter.push(0x00); // peer address type
            parameter.extend_from_slice(&[0u8; 6]); // peer address
            parameter.push(0x00); // filter policy: allow all
            parameter.push(0x7F); // tx power: no preference
            parameter.push(0x01); // primary PHY: LE 1M
            parameter.push(0x00); // secondary max skip
            parameter.push(0x01); // secondary PHY: LE 1M
            parameter.push(0x00); // advertising SID
            parameter.push(0x00); // scan request notifications disabled

            CommandPacket::new(
                HCICommand::LEController(LEController::SetExtendedAdvertisingParameters),
                parameter,
            )
        }

        fn extended_data_parameter(advertising_handle: u8, data: &[u8]) -> Vec<u8> {
            debug_assert!(data.len() <= MAX_EXTENDED_DATA_FRAGMENT_LENGTH);

            let mut parameter = Vec::with_capacity(4 + data.len());

            parameter.push(advertising_handle);
            parameter.push(0x03); // operation: complete data
            parameter.push(0x01); // fragment preference: minimize fragmentation
            parameter.push(data.len() as u8);
            parameter.extend_from_slice(data);

            parameter
        }

        pub fn set_extended_advertising_data(advertising_handle: u8, data: &[u8]) -> CommandPacket {
            CommandPacket::new(
                HCICommand::LEController(LEController::SetExtendedAdvertisingData),
                extended_data_parameter(advertising_handle, data),
            )
        }

        pub fn set_extended_scan_response_data(
            advertising_handle: u8,
            data: &[u8],
        ) -> CommandPacket {
            CommandPacket::new(
                HCICommand::LEController(LEController::SetExtendedScanResponseData),
                extended_data_parameter(advertising_handle, data),
            )
        }

        /// Enable or disable a group of advertising sets
        ///
        /// With no sets and `enable` false, every set is disabled at once.
        pub fn set_extended_advertising_enable(
            enable: bool,
            advertising_handles: &[u8],
        ) -> CommandPacket {
            let mut parameter = Vec::with_capacity(2 + advertising_handles.len() * 4);

            parameter.push(enable as u8);
            parameter.push(advertising_handles.len() as u8);

            for &advertising_handle in advertising_handles {
                parameter.push(advertising_handle);
                parameter.extend_from_slice(&0u16.to_le_bytes()); // no duration limit
                parameter.push(0x00); // unlimited extended advertising events
            }

            CommandPacket::new(
                HCICommand::LEController(LEController::SetExtendedAdvertisingEnable),
                parameter,
            )
        }

        pub fn remove_advertising_set(advertising_handle: u8) -> CommandPacket {
            CommandPacket::new(
                HCICommand::LEController(LEController::RemoveAdvertisingSet),
                vec![advertising_handle],
            )
        }

        pub fn read_maximum_advertising_data_length() -> CommandPacket {
            CommandPacket::new(
                HCICommand::LEController(LEController::ReadMaximumAdvertisingDataLength),
                Vec::new(),
            )
        }

        pub fn read_number_of_supported_advertising_sets() -> CommandPacket {
            CommandPacket::new(
                HCICommand::LEController(LEController::ReadNumberOfSupportedAdvertisingSets),
                Vec::new(),
            )
        }

        /// Parse the return parameter of read number of supported advertising sets
        pub fn supported_sets_from_return_parameter(raw: &[u8]) -> Result<u8, Error> {
            if raw.len() < 2 {
                return Err(Error::UnspecifiedError);
            }

            let status = Error::from(raw[0]);

            if !status.is_ok() {
                return Err(status);
            }

            Ok(raw[1])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::common::ConnectionHandle;

    #[test]
    fn disconnect_packet_bytes() {
        let packet = link_control::disconnect(
            ConnectionHandle::try_from(0x0001).unwrap(),
            link_control::DisconnectReason::RemoteUserTerminatedConnection,
        );

        assert_eq!(&*packet.into_packet(), &[0x06, 0x04, 0x03, 0x01, 0x00, 0x13]);
    }

    #[test]
    fn advertising_data_is_padded() {
        let packet = le::set_advertising_data(&[0x02, 0x01, 0x06]);
        let raw = packet.into_packet();

        // 3 header bytes, then a significant length byte and the 31 byte buffer
        assert_eq!(raw.len(), 3 + 32);
        assert_eq!(raw[3], 3);
        assert_eq!(&raw[4..7], &[0x02, 0x01, 0x06]);
        assert!(raw[7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn create_connection_packet_length() {
        use crate::hci::common::*;

        let params = le::CreateConnectionParameters {
            use_filter_accept_list: false,
            peer_address_type: LEAddressType::PublicDeviceAddress,
            peer_address: [1, 2, 3, 4, 5, 6],
            scan_interval: ScanInterval::default(),
            scan_window: ScanWindow::default(),
            own_address_type: le::OwnAddressType::PublicDeviceAddress,
            initial_parameters: LEConnectionParameters::try_new(
                ConnectionInterval::default(),
                0,
                SupervisionTimeout::default(),
            )
            .unwrap(),
        };

        let raw = le::create_connection(&params).into_packet();

        assert_eq!(raw.len(), 3 + 25);
        assert_eq!(raw[2], 25);
    }

    #[test]
    fn start_encryption_packet_length() {
        let raw = le::start_encryption(
            ConnectionHandle::try_from(1).unwrap(),
            0x1122334455667788,
            0x99AA,
            0x000102030405060708090A0B0C0D0E0F,
        )
        .into_packet();

        assert_eq!(raw.len(), 3 + 28);
        // the random number is little endian on the wire
        assert_eq!(raw[5], 0x88);
    }

    #[cfg(feature = "bluetooth_5_0")]
    #[test]
    fn extended_enable_packet_bytes() {
        let raw = le::extended::set_extended_advertising_enable(true, &[2, 5]).into_packet();

        assert_eq!(raw[2], 10);
        assert_eq!(raw[3], 1); // enable
        assert_eq!(raw[4], 2); // two sets
        assert_eq!(raw[5], 2); // first handle
        assert_eq!(raw[9], 5); // second handle
    }
}
