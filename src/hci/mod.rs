//! The HCI transport core
//!
//! This module contains the packet framing used on the two endpoints and the three state
//! machines built on top of them: the [`command_channel`], the [`acl`] data channel and the
//! [`runner`] for ordered command chains. The modules are split the same way the HCI
//! specification splits the interface: commands and events ride the command endpoint, ACL
//! data rides the data endpoint, and never the other way around.

pub mod acl;
pub mod cmds;
pub mod command_channel;
pub mod common;
pub mod error;
#[macro_use]
pub mod events;
pub mod opcodes;
pub mod runner;

use core::fmt;
use core::fmt::Display;

use crate::hci::common::ConnectionHandle;

/// The largest parameter payload a command packet can carry
pub const MAX_COMMAND_PARAMETER_SIZE: usize = 255;

/// Errors from converting between raw bytes and the typed packet views
#[derive(Debug, Clone, PartialEq)]
pub enum PacketConvertError {
    PacketTooSmall,
    LengthFieldMismatch,
    ParameterTooLarge,
    ReservedOpcode,
    InvalidBroadcastFlag,
    InvalidConnectionHandle(&'static str),
}

impl Display for PacketConvertError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketConvertError::PacketTooSmall => write!(f, "packet is too small for its header"),
            PacketConvertError::LengthFieldMismatch => {
                write!(f, "packet length field is inconsistent with the outer frame")
            }
            PacketConvertError::ParameterTooLarge => {
                write!(f, "parameter payload larger than the packet format allows")
            }
            PacketConvertError::ReservedOpcode => write!(f, "opcode zero is reserved"),
            PacketConvertError::InvalidBroadcastFlag => write!(f, "packet has invalid broadcast flag"),
            PacketConvertError::InvalidConnectionHandle(reason) => {
                write!(f, "invalid connection handle, {}", reason)
            }
        }
    }
}

/// A host to controller command packet
///
/// The wire form is the 16 bit opcode (little endian), one length byte, and the parameter
/// payload. Packets are move-only, sending one consumes it.
#[derive(Debug)]
pub struct CommandPacket {
    opcode: u16,
    parameter: Box<[u8]>,
}

impl CommandPacket {
    /// Create a command packet for one of the table opcodes
    ///
    /// The parameter payload must already be in its packed little endian form. Builders in
    /// [`cmds`](crate::hci::cmds) never produce a payload over the size limit, so this does
    /// not return an error; use [`try_new_raw`](CommandPacket::try_new_raw) for payloads of
    /// unchecked origin.
    pub fn new(command: opcodes::HCICommand, parameter: Vec<u8>) -> Self {
        debug_assert!(parameter.len() <= MAX_COMMAND_PARAMETER_SIZE);

        CommandPacket {
            opcode: command.as_opcode(),
            parameter: parameter.into_boxed_slice(),
        }
    }

    /// Create a command packet from a raw opcode
    ///
    /// This is the entry point for vendor commands encoded outside of the opcode table.
    ///
    /// # Errors
    /// The parameter payload does not fit in the one byte length field, or the opcode is the
    /// reserved no-op.
    pub fn try_new_raw(opcode: u16, parameter: Vec<u8>) -> Result<Self, PacketConvertError> {
        if opcode == opcodes::NO_OP {
            return Err(PacketConvertError::ReservedOpcode);
        }

        if parameter.len() > MAX_COMMAND_PARAMETER_SIZE {
            return Err(PacketConvertError::ParameterTooLarge);
        }

        Ok(CommandPacket { opcode, parameter: parameter.into_boxed_slice() })
    }

    pub fn get_opcode(&self) -> u16 {
        self.opcode
    }

    pub fn get_parameter(&self) -> &[u8] {
        &self.parameter
    }

    /// Convert into the packet bytes sent over the command endpoint
    pub fn into_packet(self) -> Box<[u8]> {
        let mut v = Vec::with_capacity(self.parameter.len() + 3);

        v.extend_from_slice(&self.opcode.to_le_bytes());

        v.push(self.parameter.len() as u8);

        v.extend_from_slice(&self.parameter);

        v.into_boxed_slice()
    }
}

/// A controller to host event packet
///
/// The wire form is the event code byte, one length byte, and the parameter payload. This is
/// only the framing view, [`events::EventsData`] is the parsed form.
#[derive(Debug, Clone)]
pub struct EventPacket {
    event_code: u8,
    parameter: Box<[u8]>,
}

impl EventPacket {
    /// Attempt to frame an event packet from the raw endpoint bytes
    pub fn from_packet(packet: &[u8]) -> Result<Self, PacketConvertError> {
        if packet.len() < 2 {
            return Err(PacketConvertError::PacketTooSmall);
        }

        let len = packet[1] as usize;

        if packet.len() < 2 + len {
            return Err(PacketConvertError::LengthFieldMismatch);
        }

        Ok(EventPacket {
            event_code: packet[0],
            parameter: Box::from(&packet[2..2 + len]),
        })
    }

    pub fn get_event_code(&self) -> u8 {
        self.event_code
    }

    pub fn get_parameter(&self) -> &[u8] {
        &self.parameter
    }
}

/// The packet boundary flag of an ACL data packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclPacketBoundary {
    FirstNonFlushable,
    ContinuingFragment,
    FirstAutoFlushable,
    CompleteL2capPdu,
}

impl AclPacketBoundary {
    /// Get the value shifted into the correct place of the first 16 bits of the HCI ACL data
    /// packet. The returned value is in host byte order.
    fn get_shifted_val(&self) -> u16 {
        (match self {
            AclPacketBoundary::FirstNonFlushable => 0x0,
            AclPacketBoundary::ContinuingFragment => 0x1,
            AclPacketBoundary::FirstAutoFlushable => 0x2,
            AclPacketBoundary::CompleteL2capPdu => 0x3,
        }) << 12
    }

    /// Get the `AclPacketBoundary` from the first 16 bits of a HCI ACL data packet. The input
    /// does not need to be masked to only the packet boundary flag, but it does need to be in
    /// host byte order.
    fn from_shifted_val(val: u16) -> Self {
        match (val >> 12) & 3 {
            0x0 => AclPacketBoundary::FirstNonFlushable,
            0x1 => AclPacketBoundary::ContinuingFragment,
            0x2 => AclPacketBoundary::FirstAutoFlushable,
            0x3 => AclPacketBoundary::CompleteL2capPdu,
            _ => unreachable!(),
        }
    }
}

/// The broadcast flag of an ACL data packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclBroadcastFlag {
    /// Point-to-point message
    NoBroadcast,
    /// Broadcast to all active peripherals
    ActiveBroadcast,
}

impl AclBroadcastFlag {
    fn get_shifted_val(&self) -> u16 {
        (match self {
            AclBroadcastFlag::NoBroadcast => 0x0,
            AclBroadcastFlag::ActiveBroadcast => 0x1,
        }) << 14
    }

    fn try_from_shifted_val(val: u16) -> Result<Self, ()> {
        match (val >> 14) & 3 {
            0x0 => Ok(AclBroadcastFlag::NoBroadcast),
            0x1 => Ok(AclBroadcastFlag::ActiveBroadcast),
            _ => Err(()),
        }
    }
}

/// A HCI ACL data packet
///
/// The wire form in both directions is the 16 bit handle-and-flags field (low 12 bits the
/// connection handle, then the packet boundary flag, then the broadcast flag), a 16 bit data
/// length, and the payload. Both 16 bit fields are little endian.
#[derive(Debug)]
pub struct HciAclData {
    connection_handle: ConnectionHandle,
    packet_boundary_flag: AclPacketBoundary,
    broadcast_flag: AclBroadcastFlag,
    payload: Box<[u8]>,
}

impl HciAclData {
    /// Size of the header on the data endpoint
    pub const HEADER_SIZE: usize = 4;

    pub fn new(
        connection_handle: ConnectionHandle,
        packet_boundary_flag: AclPacketBoundary,
        broadcast_flag: AclBroadcastFlag,
        payload: Box<[u8]>,
    ) -> Self {
        HciAclData { connection_handle, packet_boundary_flag, broadcast_flag, payload }
    }

    pub fn get_handle(&self) -> ConnectionHandle {
        self.connection_handle
    }

    pub fn get_payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn get_packet_boundary_flag(&self) -> AclPacketBoundary {
        self.packet_boundary_flag
    }

    pub fn get_broadcast_flag(&self) -> AclBroadcastFlag {
        self.broadcast_flag
    }

    /// Convert into the packet bytes sent over the data endpoint
    pub fn into_packet(self) -> Box<[u8]> {
        let mut v = Vec::with_capacity(self.payload.len() + Self::HEADER_SIZE);

        let first_2_bytes = self.connection_handle.get_raw_handle()
            | self.packet_boundary_flag.get_shifted_val()
            | self.broadcast_flag.get_shifted_val();

        v.extend_from_slice(&first_2_bytes.to_le_bytes());

        v.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());

        v.extend_from_slice(&self.payload);

        v.into_boxed_slice()
    }

    /// Attempt to create a `HciAclData` from raw endpoint bytes
    ///
    /// An error is returned when the packet is not in the HCI ACL data packet format.
    pub fn from_packet(packet: &[u8]) -> Result<Self, PacketConvertError> {
        if packet.len() < Self::HEADER_SIZE {
            return Err(PacketConvertError::PacketTooSmall);
        }

        let first_2_bytes = <u16>::from_le_bytes([packet[0], packet[1]]);

        let connection_handle = ConnectionHandle::try_from(first_2_bytes & 0xFFF)
            .map_err(PacketConvertError::InvalidConnectionHandle)?;

        let packet_boundary_flag = AclPacketBoundary::from_shifted_val(first_2_bytes);

        let broadcast_flag = AclBroadcastFlag::try_from_shifted_val(first_2_bytes)
            .map_err(|_| PacketConvertError::InvalidBroadcastFlag)?;

        let length = <u16>::from_le_bytes([packet[2], packet[3]]) as usize;

        if packet.len() < Self::HEADER_SIZE + length {
            return Err(PacketConvertError::LengthFieldMismatch);
        }

        Ok(HciAclData {
            connection_handle,
            packet_boundary_flag,
            broadcast_flag,
            payload: Box::from(&packet[Self::HEADER_SIZE..Self::HEADER_SIZE + length]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::opcodes::{HCICommand, LEController};

    #[test]
    fn command_packet_wire_form() {
        let packet = CommandPacket::new(
            HCICommand::LEController(LEController::SetScanEnable),
            vec![0x01, 0x00],
        );

        assert_eq!(&*packet.into_packet(), &[0x0C, 0x20, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn no_op_cannot_be_built() {
        assert!(CommandPacket::try_new_raw(0x0000, Vec::new()).is_err());
    }

    #[test]
    fn acl_data_round_trip() {
        let data = HciAclData::new(
            ConnectionHandle::try_from(0x023).unwrap(),
            AclPacketBoundary::FirstAutoFlushable,
            AclBroadcastFlag::NoBroadcast,
            Box::from(&[1u8, 2, 3][..]),
        );

        let raw = data.into_packet();

        assert_eq!(&*raw, &[0x23, 0x20, 0x03, 0x00, 1, 2, 3]);

        let parsed = HciAclData::from_packet(&raw).unwrap();

        assert_eq!(parsed.get_handle().get_raw_handle(), 0x023);
        assert_eq!(parsed.get_packet_boundary_flag(), AclPacketBoundary::FirstAutoFlushable);
        assert_eq!(parsed.get_payload(), &[1, 2, 3]);
    }

    #[test]
    fn event_packet_length_check() {
        assert!(EventPacket::from_packet(&[0x0E, 0x04, 0x01]).is_err());
        assert!(EventPacket::from_packet(&[0x0E, 0x01, 0x01]).is_ok());
    }
}
