//! Advertising data blocks
//!
//! The engines treat advertising payloads as opaque blocks behind the
//! [`AdvertisingDataBlock`] seam: they only ever size a block, write it into a command
//! buffer, and patch a tx power level into a copy. [`AdvertisingData`] is the concrete
//! implementation, a list of AD structures in the `(length, type, data)` wire format.

use crate::serializer;

/// AD type codes used by the builder methods
mod assigned_types {
    pub const FLAGS: u8 = 0x01;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const TX_POWER_LEVEL: u8 = 0x0A;
    pub const SERVICE_DATA_16: u8 = 0x16;
    pub const MANUFACTURER_SPECIFIC_DATA: u8 = 0xFF;
}

/// Flag bits for the flags AD structure
pub mod flags {
    pub const LE_LIMITED_DISCOVERABLE_MODE: u8 = 1 << 0;
    pub const LE_GENERAL_DISCOVERABLE_MODE: u8 = 1 << 1;
    pub const BR_EDR_NOT_SUPPORTED: u8 = 1 << 2;
}

/// The advertising payload seam consumed by the advertiser
pub trait AdvertisingDataBlock: Send {
    /// Size of the block as it would be written, with or without a flags structure
    fn calculate_block_size(&self, include_flags: bool) -> usize;

    /// Write the block into `buffer`, returning the number of bytes written
    ///
    /// The buffer must be at least [`calculate_block_size`]
    /// (AdvertisingDataBlock::calculate_block_size) bytes for the same `flags` choice.
    fn write_block(&self, buffer: &mut [u8], flags: Option<u8>) -> usize;

    /// Set (or overwrite) the tx power level structure
    fn set_tx_power(&mut self, power: i8);

    fn copy(&self) -> Box<dyn AdvertisingDataBlock>;
}

#[derive(Debug, Clone)]
struct AdStructure {
    ad_type: u8,
    data: Vec<u8>,
}

/// A list of AD structures
#[derive(Debug, Clone, Default)]
pub struct AdvertisingData {
    structures: Vec<AdStructure>,
    tx_power: Option<i8>,
}

impl AdvertisingData {
    pub fn new() -> Self {
        AdvertisingData::default()
    }

    /// Append a raw AD structure
    pub fn add_raw(&mut self, ad_type: u8, data: &[u8]) {
        debug_assert!(data.len() <= 0xFE);

        self.structures.push(AdStructure { ad_type, data: data.to_vec() });
    }

    pub fn add_complete_local_name(&mut self, name: &str) {
        self.add_raw(assigned_types::COMPLETE_LOCAL_NAME, name.as_bytes());
    }

    pub fn add_manufacturer_data(&mut self, company_id: u16, data: &[u8]) {
        let mut payload = Vec::with_capacity(2 + data.len());

        payload.extend_from_slice(&company_id.to_le_bytes());
        payload.extend_from_slice(data);

        self.structures.push(AdStructure {
            ad_type: assigned_types::MANUFACTURER_SPECIFIC_DATA,
            data: payload,
        });
    }

    /// Append 16 bit UUID service data with a serialized payload
    pub fn add_service_data_16<T>(&mut self, uuid: u16, data: &T) -> serializer::Result<()>
    where
        T: serde::Serialize,
    {
        let serialized = serializer::serialize(data)?;

        let mut payload = Vec::with_capacity(2 + serialized.len());

        payload.extend_from_slice(&uuid.to_le_bytes());
        payload.extend_from_slice(&serialized);

        self.structures.push(AdStructure { ad_type: assigned_types::SERVICE_DATA_16, data: payload });

        Ok(())
    }
}

impl AdvertisingDataBlock for AdvertisingData {
    fn calculate_block_size(&self, include_flags: bool) -> usize {
        let structures: usize = self.structures.iter().map(|s| 2 + s.data.len()).sum();

        // flags and tx power are single byte structures, 3 bytes with their headers
        structures
            + if include_flags { 3 } else { 0 }
            + if self.tx_power.is_some() { 3 } else { 0 }
    }

    fn write_block(&self, buffer: &mut [u8], flags: Option<u8>) -> usize {
        debug_assert!(buffer.len() >= self.calculate_block_size(flags.is_some()));

        let mut at = 0;

        let mut put = |bytes: &[u8]| {
            buffer[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };

        if let Some(flags) = flags {
            put(&[2, assigned_types::FLAGS, flags]);
        }

        for structure in self.structures.iter() {
            put(&[(structure.data.len() + 1) as u8, structure.ad_type]);
            put(&structure.data);
        }

        if let Some(power) = self.tx_power {
            put(&[2, assigned_types::TX_POWER_LEVEL, power as u8]);
        }

        at
    }

    fn set_tx_power(&mut self, power: i8) {
        self.tx_power = Some(power);
    }

    fn copy(&self) -> Box<dyn AdvertisingDataBlock> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_layout() {
        let mut data = AdvertisingData::new();

        data.add_complete_local_name("ab");

        assert_eq!(data.calculate_block_size(false), 4);
        assert_eq!(data.calculate_block_size(true), 7);

        let mut buffer = vec![0u8; 7];

        let written = data.write_block(&mut buffer, Some(flags::LE_GENERAL_DISCOVERABLE_MODE));

        assert_eq!(written, 7);
        assert_eq!(buffer, vec![2, 0x01, 0x02, 3, 0x09, b'a', b'b']);
    }

    #[test]
    fn tx_power_is_patched_into_copies() {
        let mut data = AdvertisingData::new();

        data.add_manufacturer_data(0x00E0, &[1, 2]);

        let mut copy = data.copy();

        copy.set_tx_power(-8);

        // the original is untouched
        assert_eq!(data.calculate_block_size(false), 6);
        assert_eq!(copy.calculate_block_size(false), 9);

        let mut buffer = vec![0u8; 9];

        copy.write_block(&mut buffer, None);

        assert_eq!(&buffer[6..], &[2, 0x0A, 0xF8]);
    }

    #[test]
    fn service_data_round_trips_through_the_serializer() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Measurement {
            sequence: u32,
            value: i16,
        }

        let mut data = AdvertisingData::new();

        data.add_service_data_16(0x180F, &Measurement { sequence: 7, value: -2 }).unwrap();

        let mut buffer = vec![0u8; data.calculate_block_size(false)];

        data.write_block(&mut buffer, None);

        // length, type, uuid, then the serialized payload
        assert_eq!(buffer[1], 0x16);
        assert_eq!(&buffer[2..4], &[0x0F, 0x18]);

        let parsed: Measurement = crate::serializer::deserialize(&buffer[4..]).unwrap();

        assert_eq!(parsed, Measurement { sequence: 7, value: -2 });
    }
}
