//! Non-control endpoint registry and the single-packet I/O operations built on it.

use core::fmt;

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::phy::UsbPhy;

/// Number of endpoint table slots: 16 endpoint numbers in both directions, minus control IN/OUT.
pub const ENDPOINT_TABLE_CAPACITY: usize = 32 - 2;

/// Largest `wMaxPacketSize` accepted for any endpoint type.
pub const MAX_ENDPOINT_PACKET_SIZE: u16 = 1024;

/// `bEndpointAddress`: endpoint number in bits 3..0, direction in bit 7 (set for IN).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    pub const CONTROL_OUT: Self = Self(0x00);
    pub const CONTROL_IN: Self = Self(0x80);

    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn in_ep(number: u8) -> Self {
        Self(0x80 | (number & 0x0f))
    }

    pub const fn out_ep(number: u8) -> Self {
        Self(number & 0x0f)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn number(self) -> u8 {
        self.0 & 0x0f
    }

    pub const fn is_in(self) -> bool {
        (self.0 & 0x80) != 0
    }

    pub const fn is_control(self) -> bool {
        self.number() == 0
    }

    /// Reserved bits 6..4 must be zero.
    pub const fn is_well_formed(self) -> bool {
        (self.0 & 0x70) == 0
    }

    fn table_index(self) -> Option<usize> {
        if !self.is_well_formed() || self.is_control() {
            return None;
        }
        let index = ((self.number() as usize) << 1) | (self.is_in() as usize);
        Some(index - 2)
    }

    fn from_table_index(index: usize) -> Self {
        let slot = index + 2;
        let number = (slot >> 1) as u8;
        if slot & 1 != 0 {
            Self::in_ep(number)
        } else {
            Self::out_ep(number)
        }
    }
}

impl fmt::Debug for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointAddress(0x{:02x})", self.0)
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.is_in() { "IN" } else { "OUT" };
        write!(f, "EP{} {}", self.number(), dir)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EndpointFlags: u8 {
        const ENABLED = 1 << 0;
        const STALLED = 1 << 1;
        /// An OUT packet has been received and not yet collected by `read_finish`.
        const READ_COMPLETE = 1 << 2;
    }
}

/// Token chosen by the device class when registering an endpoint; handed back through
/// [`crate::DeviceClass::endpoint_event`] when a transfer on that endpoint completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointRecord {
    callback: Option<CallbackId>,
    max_packet_size: u16,
    ty: EndpointType,
    flags: EndpointFlags,
    pending: u8,
}

impl EndpointRecord {
    pub fn callback(&self) -> Option<CallbackId> {
        self.callback
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.ty
    }

    pub fn flags(&self) -> EndpointFlags {
        self.flags
    }

    pub fn pending(&self) -> u8 {
        self.pending
    }

    pub fn is_stalled(&self) -> bool {
        self.flags.contains(EndpointFlags::STALLED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("{0} is not a valid non-control endpoint")]
    InvalidEndpoint(EndpointAddress),
    #[error("{0} is already registered")]
    AlreadyRegistered(EndpointAddress),
    #[error("{0} is not registered")]
    NotRegistered(EndpointAddress),
    #[error("{endpoint} does not support {ty:?} transfers")]
    Unsupported {
        endpoint: EndpointAddress,
        ty: EndpointType,
    },
    #[error("invalid max packet size {max_packet} for {endpoint}")]
    InvalidMaxPacket {
        endpoint: EndpointAddress,
        max_packet: u16,
    },
    #[error("{0} transfer direction does not match the operation")]
    WrongDirection(EndpointAddress),
    #[error("PHY rejected the operation on {0}")]
    PhyRejected(EndpointAddress),
    #[error("{0} already has a transfer in flight")]
    Busy(EndpointAddress),
    #[error("{0} is halted")]
    Stalled(EndpointAddress),
    #[error("no read was started on {0}")]
    Idle(EndpointAddress),
    #[error("packet of {len} bytes exceeds max packet size {max}")]
    PacketTooLarge { len: usize, max: u16 },
    #[error("buffer of {len} bytes is smaller than max packet size {max}")]
    BufferTooSmall { len: usize, max: u16 },
}

/// Fixed-capacity table of [`EndpointRecord`]s indexed by endpoint address.
#[derive(Clone, Debug)]
pub struct EndpointTable {
    records: [Option<EndpointRecord>; ENDPOINT_TABLE_CAPACITY],
}

impl EndpointTable {
    pub fn new() -> Self {
        Self {
            records: core::array::from_fn(|_| None),
        }
    }

    pub fn get(&self, endpoint: EndpointAddress) -> Result<&EndpointRecord, EndpointError> {
        let index = endpoint
            .table_index()
            .ok_or(EndpointError::InvalidEndpoint(endpoint))?;
        self.records[index]
            .as_ref()
            .ok_or(EndpointError::NotRegistered(endpoint))
    }

    fn get_mut(&mut self, endpoint: EndpointAddress) -> Result<&mut EndpointRecord, EndpointError> {
        let index = endpoint
            .table_index()
            .ok_or(EndpointError::InvalidEndpoint(endpoint))?;
        self.records[index]
            .as_mut()
            .ok_or(EndpointError::NotRegistered(endpoint))
    }

    pub fn is_registered(&self, endpoint: EndpointAddress) -> bool {
        self.get(endpoint).is_ok()
    }

    pub fn len(&self) -> usize {
        self.records.iter().filter(|r| r.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (EndpointAddress, &EndpointRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (EndpointAddress::from_table_index(i), r)))
    }

    /// Accounts for a completed hardware transfer. Returns the callback to invoke, or `None` if
    /// the event does not match an outstanding transfer.
    pub(crate) fn complete_transfer(
        &mut self,
        endpoint: EndpointAddress,
    ) -> Option<Option<CallbackId>> {
        let record = self.get_mut(endpoint).ok()?;
        if record.pending == 0 {
            return None;
        }
        record.pending -= 1;
        if !endpoint.is_in() {
            record.flags.insert(EndpointFlags::READ_COMPLETE);
        }
        Some(record.callback)
    }
}

impl Default for EndpointTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Endpoint operations over the table and the PHY.
///
/// This is the handle the device class receives inside configuration and endpoint callbacks, and
/// the implementation behind the thread-context endpoint API of [`crate::UsbDevice`].
pub struct Endpoints<'a> {
    table: &'a mut EndpointTable,
    phy: &'a mut dyn UsbPhy,
}

impl<'a> Endpoints<'a> {
    pub(crate) fn new(table: &'a mut EndpointTable, phy: &'a mut dyn UsbPhy) -> Self {
        Self { table, phy }
    }

    pub fn table(&self) -> &EndpointTable {
        self.table
    }

    pub fn add(
        &mut self,
        endpoint: EndpointAddress,
        max_packet: u16,
        ty: EndpointType,
        callback: Option<CallbackId>,
    ) -> Result<(), EndpointError> {
        let index = endpoint
            .table_index()
            .ok_or(EndpointError::InvalidEndpoint(endpoint))?;
        if self.table.records[index].is_some() {
            return Err(EndpointError::AlreadyRegistered(endpoint));
        }
        if max_packet == 0 || max_packet > MAX_ENDPOINT_PACKET_SIZE {
            return Err(EndpointError::InvalidMaxPacket {
                endpoint,
                max_packet,
            });
        }
        if !self.phy.endpoint_capabilities().supports(endpoint, ty) {
            return Err(EndpointError::Unsupported { endpoint, ty });
        }
        if !self.phy.endpoint_add(endpoint, max_packet, ty) {
            return Err(EndpointError::PhyRejected(endpoint));
        }

        self.table.records[index] = Some(EndpointRecord {
            callback,
            max_packet_size: max_packet,
            ty,
            flags: EndpointFlags::ENABLED,
            pending: 0,
        });
        debug!(%endpoint, max_packet, ?ty, "endpoint added");
        Ok(())
    }

    pub fn remove(&mut self, endpoint: EndpointAddress) -> Result<(), EndpointError> {
        let index = endpoint
            .table_index()
            .ok_or(EndpointError::InvalidEndpoint(endpoint))?;
        let Some(record) = self.table.records[index].take() else {
            return Err(EndpointError::NotRegistered(endpoint));
        };
        if record.pending > 0 {
            self.phy.endpoint_abort(endpoint);
        }
        self.phy.endpoint_remove(endpoint);
        debug!(%endpoint, "endpoint removed");
        Ok(())
    }

    /// Removes every registered endpoint, e.g. when the device leaves the Configured state.
    pub fn remove_all(&mut self) {
        for index in 0..ENDPOINT_TABLE_CAPACITY {
            let endpoint = EndpointAddress::from_table_index(index);
            if self.table.records[index].is_some() {
                // Cannot fail: the slot is valid and occupied.
                let _ = self.remove(endpoint);
            }
        }
    }

    /// Cancels every in-flight transfer and drops uncollected OUT data.
    pub fn abort_pending(&mut self) {
        for (index, slot) in self.table.records.iter_mut().enumerate() {
            let Some(record) = slot.as_mut() else {
                continue;
            };
            if record.pending > 0 {
                self.phy.endpoint_abort(EndpointAddress::from_table_index(index));
                record.pending = 0;
            }
            record.flags.remove(EndpointFlags::READ_COMPLETE);
        }
    }

    pub fn stall(&mut self, endpoint: EndpointAddress) -> Result<(), EndpointError> {
        let record = self.table.get_mut(endpoint)?;
        if record.pending > 0 {
            self.phy.endpoint_abort(endpoint);
            record.pending = 0;
        }
        record.flags.insert(EndpointFlags::STALLED);
        self.phy.endpoint_stall(endpoint);
        debug!(%endpoint, "endpoint stalled");
        Ok(())
    }

    /// Clears STALL and resets the data toggle.
    pub fn unstall(&mut self, endpoint: EndpointAddress) -> Result<(), EndpointError> {
        let record = self.table.get_mut(endpoint)?;
        if record.pending > 0 {
            self.phy.endpoint_abort(endpoint);
            record.pending = 0;
        }
        record.flags.remove(EndpointFlags::STALLED);
        self.phy.endpoint_unstall(endpoint);
        debug!(%endpoint, "endpoint unstalled");
        Ok(())
    }

    pub fn is_stalled(&self, endpoint: EndpointAddress) -> Result<bool, EndpointError> {
        Ok(self.table.get(endpoint)?.is_stalled())
    }

    pub fn max_packet_size(&self, endpoint: EndpointAddress) -> Result<u16, EndpointError> {
        Ok(self.table.get(endpoint)?.max_packet_size)
    }

    /// Arms an OUT endpoint to receive the next packet.
    pub fn read_start(&mut self, endpoint: EndpointAddress) -> Result<(), EndpointError> {
        let record = self.table.get_mut(endpoint)?;
        if endpoint.is_in() {
            return Err(EndpointError::WrongDirection(endpoint));
        }
        if record.pending > 0 {
            return Err(EndpointError::Busy(endpoint));
        }
        if record.is_stalled() {
            return Err(EndpointError::Stalled(endpoint));
        }
        if !self.phy.endpoint_read(endpoint, record.max_packet_size) {
            return Err(EndpointError::PhyRejected(endpoint));
        }
        record.flags.remove(EndpointFlags::READ_COMPLETE);
        record.pending += 1;
        trace!(%endpoint, "read armed");
        Ok(())
    }

    /// Collects the packet of a read started with [`Endpoints::read_start`].
    ///
    /// Returns `Ok(None)` while the read is still in flight.
    pub fn read_finish(
        &mut self,
        endpoint: EndpointAddress,
        buf: &mut [u8],
    ) -> Result<Option<usize>, EndpointError> {
        let record = self.table.get_mut(endpoint)?;
        if endpoint.is_in() {
            return Err(EndpointError::WrongDirection(endpoint));
        }
        if buf.len() < record.max_packet_size as usize {
            return Err(EndpointError::BufferTooSmall {
                len: buf.len(),
                max: record.max_packet_size,
            });
        }
        if record.pending > 0 {
            return Ok(None);
        }
        if !record.flags.contains(EndpointFlags::READ_COMPLETE) {
            return Err(EndpointError::Idle(endpoint));
        }
        record.flags.remove(EndpointFlags::READ_COMPLETE);
        let len = self.phy.endpoint_read_result(endpoint, buf);
        trace!(%endpoint, len, "read finished");
        Ok(Some(len))
    }

    /// Queues a single IN packet.
    pub fn write(&mut self, endpoint: EndpointAddress, data: &[u8]) -> Result<(), EndpointError> {
        let record = self.table.get_mut(endpoint)?;
        if !endpoint.is_in() {
            return Err(EndpointError::WrongDirection(endpoint));
        }
        if data.len() > record.max_packet_size as usize {
            return Err(EndpointError::PacketTooLarge {
                len: data.len(),
                max: record.max_packet_size,
            });
        }
        if record.pending > 0 {
            return Err(EndpointError::Busy(endpoint));
        }
        if record.is_stalled() {
            return Err(EndpointError::Stalled(endpoint));
        }
        if !self.phy.endpoint_write(endpoint, data) {
            warn!(%endpoint, "PHY rejected endpoint write");
            return Err(EndpointError::PhyRejected(endpoint));
        }
        record.pending += 1;
        trace!(%endpoint, len = data.len(), "write queued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_index_covers_all_non_control_endpoints() {
        let mut seen = [false; ENDPOINT_TABLE_CAPACITY];
        for number in 1..16u8 {
            for ep in [EndpointAddress::in_ep(number), EndpointAddress::out_ep(number)] {
                let index = ep.table_index().unwrap();
                assert!(!seen[index], "duplicate index for {ep}");
                seen[index] = true;
                assert_eq!(EndpointAddress::from_table_index(index), ep);
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn control_and_malformed_addresses_have_no_slot() {
        assert_eq!(EndpointAddress::CONTROL_IN.table_index(), None);
        assert_eq!(EndpointAddress::CONTROL_OUT.table_index(), None);
        assert_eq!(EndpointAddress::from_raw(0x91).table_index(), None);
    }

    #[test]
    fn address_accessors() {
        let ep = EndpointAddress::from_raw(0x83);
        assert!(ep.is_in());
        assert_eq!(ep.number(), 3);
        assert_eq!(ep.to_string(), "EP3 IN");
        assert_eq!(EndpointAddress::out_ep(2).to_string(), "EP2 OUT");
    }

    #[test]
    fn empty_table_rejects_lookups() {
        let table = EndpointTable::new();
        assert!(table.is_empty());
        assert_eq!(
            table.get(EndpointAddress::in_ep(1)),
            Err(EndpointError::NotRegistered(EndpointAddress::in_ep(1)))
        );
        assert_eq!(
            table.get(EndpointAddress::CONTROL_IN),
            Err(EndpointError::InvalidEndpoint(EndpointAddress::CONTROL_IN))
        );
    }
}
