//! Host side HCI transport core for Bluetooth controllers.
//!
//! This library owns the two endpoints between a host stack and a Bluetooth controller, the
//! command endpoint and the ACL data endpoint, and implements the flow control contracts for
//! both of them. On top of the two channels it provides the LE procedure engines that turn
//! long-lived HCI conversations into single cancellable operations: connecting, advertising,
//! scanning, and per-connection encryption.
//!
//! The layers above (L2CAP and up) and the physical transport driver below are both outside of
//! this library. The driver side is reached through the [`transport::HciDevice`] abstraction,
//! the upper layers consume the channel and engine types re-exported from [`hci`], [`le`] and
//! [`conn`].

pub mod conn;
pub mod hci;
pub mod le;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_util;

/// A Bluetooth device address
///
/// Addresses are always kept in the little endian byte order used on the wire, so the "most
/// significant" printed octet is the last element of the array.
pub type BluetoothDeviceAddress = [u8; 6];

/// Create an address from the common human readable ordering (most significant octet first)
pub fn address_from_readable(readable: [u8; 6]) -> BluetoothDeviceAddress {
    let mut addr = readable;
    addr.reverse();
    addr
}

pub(crate) mod serializer {
    //! Payload serialization used for typed advertising service data

    pub type Result<T> = core::result::Result<T, bincode::Error>;

    pub fn serialize<T>(val: &T) -> Result<Vec<u8>>
    where
        T: serde::Serialize,
    {
        bincode::serialize(val)
    }

    pub fn deserialize<'d, T>(bytes: &'d [u8]) -> Result<T>
    where
        T: serde::Deserialize<'d>,
    {
        bincode::deserialize(bytes)
    }
}
