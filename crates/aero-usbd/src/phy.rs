//! Physical-layer interface consumed by [`crate::UsbDevice`].
//!
//! A PHY owns the transceiver, endpoint registers and FIFOs. It reports bus activity as
//! [`PhyEvent`]s, which must be delivered to the device one at a time (either pushed through
//! [`crate::UsbDevice::handle_event`] from interrupt context, or queued and drained by
//! [`crate::UsbDevice::process`]).

use bitflags::bitflags;

use crate::endpoint::{EndpointAddress, EndpointType};
use crate::setup::SETUP_PACKET_LEN;

/// Hardware event reported by the PHY.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhyEvent {
    /// VBUS detected (`true`) or lost (`false`).
    Power(bool),
    /// Bus entered (`true`) or left (`false`) the suspended state.
    Suspend(bool),
    /// Start of frame with the 11-bit frame number.
    Sof(u16),
    /// USB bus reset.
    Reset,
    /// A SETUP packet is available through [`UsbPhy::ep0_setup_read_result`].
    Ep0Setup,
    /// An OUT packet armed by [`UsbPhy::ep0_read`] has been received.
    Ep0Out,
    /// A packet queued by [`UsbPhy::ep0_write`] has been acknowledged by the host.
    Ep0In,
    /// An OUT transfer armed by [`UsbPhy::endpoint_read`] has completed.
    Out(EndpointAddress),
    /// An IN transfer queued by [`UsbPhy::endpoint_write`] has completed.
    In(EndpointAddress),
}

bitflags! {
    /// Transfer types an endpoint number can be configured for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EndpointTypeMask: u8 {
        const CONTROL = 1 << 0;
        const ISOCHRONOUS = 1 << 1;
        const BULK = 1 << 2;
        const INTERRUPT = 1 << 3;
    }
}

impl EndpointTypeMask {
    pub fn from_type(ty: EndpointType) -> Self {
        match ty {
            EndpointType::Control => Self::CONTROL,
            EndpointType::Isochronous => Self::ISOCHRONOUS,
            EndpointType::Bulk => Self::BULK,
            EndpointType::Interrupt => Self::INTERRUPT,
        }
    }
}

/// Per endpoint number capability table advertised by a PHY.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointCapabilities {
    entries: [EndpointTypeMask; 16],
}

impl EndpointCapabilities {
    /// Every endpoint number supports every non-control transfer type.
    pub fn all() -> Self {
        let mut entries = [EndpointTypeMask::BULK
            | EndpointTypeMask::INTERRUPT
            | EndpointTypeMask::ISOCHRONOUS; 16];
        entries[0] = EndpointTypeMask::CONTROL;
        Self { entries }
    }

    /// Only endpoint 0 (control) is available.
    pub fn control_only() -> Self {
        let mut entries = [EndpointTypeMask::empty(); 16];
        entries[0] = EndpointTypeMask::CONTROL;
        Self { entries }
    }

    pub fn with(mut self, number: u8, mask: EndpointTypeMask) -> Self {
        if let Some(entry) = self.entries.get_mut(number as usize) {
            *entry = mask;
        }
        self
    }

    pub fn get(&self, number: u8) -> EndpointTypeMask {
        self.entries
            .get(number as usize)
            .copied()
            .unwrap_or(EndpointTypeMask::empty())
    }

    pub fn supports(&self, endpoint: EndpointAddress, ty: EndpointType) -> bool {
        self.get(endpoint.number())
            .contains(EndpointTypeMask::from_type(ty))
    }
}

impl Default for EndpointCapabilities {
    fn default() -> Self {
        Self::all()
    }
}

/// Driver for the USB transceiver hardware.
///
/// Endpoint 0 is always enabled by the PHY; the `endpoint_*` operations are only used for the
/// non-control endpoints registered through the endpoint table.
pub trait UsbPhy {
    fn init(&mut self);
    fn deinit(&mut self);

    /// Whether VBUS is currently present.
    fn powered(&self) -> bool;

    /// Enables the D+/D- pull-up so the host sees the device.
    fn connect(&mut self);
    fn disconnect(&mut self);

    fn configure(&mut self);
    fn unconfigure(&mut self);

    fn sof_enable(&mut self);
    fn sof_disable(&mut self);

    fn set_address(&mut self, address: u8);

    /// Drives resume signalling on the bus.
    fn remote_wakeup(&mut self);

    fn endpoint_capabilities(&self) -> EndpointCapabilities {
        EndpointCapabilities::all()
    }

    /// Negotiates the endpoint 0 packet size, returning the size the hardware will use.
    fn ep0_set_max_packet(&mut self, max_packet: u16) -> u16;

    /// Returns the most recently received SETUP packet.
    fn ep0_setup_read_result(&mut self) -> [u8; SETUP_PACKET_LEN];

    /// Arms endpoint 0 to receive an OUT packet of at most `max_len` bytes.
    fn ep0_read(&mut self, max_len: usize);

    /// Copies the OUT packet received on endpoint 0 into `buf` and returns the packet length.
    ///
    /// The returned length may exceed `buf.len()` when the host sent more than was armed; only
    /// `buf.len()` bytes are copied in that case.
    fn ep0_read_result(&mut self, buf: &mut [u8]) -> usize;

    /// Queues an IN packet on endpoint 0. An empty slice sends a zero-length packet.
    fn ep0_write(&mut self, data: &[u8]);

    fn ep0_stall(&mut self);

    fn endpoint_add(&mut self, endpoint: EndpointAddress, max_packet: u16, ty: EndpointType)
        -> bool;
    fn endpoint_remove(&mut self, endpoint: EndpointAddress);
    fn endpoint_stall(&mut self, endpoint: EndpointAddress);

    /// Clears STALL and resets the data toggle to DATA0.
    fn endpoint_unstall(&mut self, endpoint: EndpointAddress);

    /// Arms an OUT endpoint to receive one packet of at most `max_packet` bytes.
    fn endpoint_read(&mut self, endpoint: EndpointAddress, max_packet: u16) -> bool;

    /// Copies the completed OUT packet into `buf` and returns the number of bytes copied.
    fn endpoint_read_result(&mut self, endpoint: EndpointAddress, buf: &mut [u8]) -> usize;

    fn endpoint_write(&mut self, endpoint: EndpointAddress, data: &[u8]) -> bool;

    /// Cancels an armed read or queued write.
    fn endpoint_abort(&mut self, endpoint: EndpointAddress);

    /// Next pending hardware event, for PHYs that defer interrupt work to
    /// [`crate::UsbDevice::process`].
    fn poll_event(&mut self) -> Option<PhyEvent> {
        None
    }
}
