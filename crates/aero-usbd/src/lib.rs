//! Device-side USB 2.0 engine.
//!
//! The crate sits between a USB transceiver driver ([`UsbPhy`]) and a device class
//! ([`DeviceClass`]) and implements what every USB peripheral needs to enumerate and exchange data:
//!
//! - [`UsbDevice`]: endpoint-0 control transfers (Setup/Data/Status stages, multi-packet data
//!   stages with zero-length packet termination, abort on a new SETUP or bus reset) and the device
//!   state machine (Attached/Powered/Default/Address/Configured)
//! - standard request handling (GET_DESCRIPTOR, SET_ADDRESS, SET_CONFIGURATION, ...), with
//!   everything else delegated to the device class
//! - [`EndpointTable`] / [`Endpoints`]: registration and single-packet I/O on non-control
//!   endpoints
//! - [`ConcurrencyGuard`]: re-entrant locking between interrupt-context events and thread-context
//!   API calls over a platform [`CriticalSection`]
//!
//! Descriptor contents and class behaviour (HID, MSC, ...) are supplied by the [`DeviceClass`].

mod class;
mod config;
mod control;
pub mod descriptor;
mod device;
mod endpoint;
mod guard;
mod lifecycle;
mod phy;
pub mod setup;
mod standard;

pub use class::{DeviceClass, RequestResult};
pub use config::{DeviceConfig, MAX_PACKET_SIZE_EP0};
pub use control::{
    in_packet_count, needs_zlp, ControlStage, ControlTransfer, InPacket, PendingCallback,
    TransferDirection,
};
pub use device::UsbDevice;
pub use endpoint::{
    CallbackId, EndpointAddress, EndpointError, EndpointFlags, EndpointRecord, EndpointTable,
    EndpointType, Endpoints, ENDPOINT_TABLE_CAPACITY, MAX_ENDPOINT_PACKET_SIZE,
};
pub use guard::{ConcurrencyGuard, CriticalSection, GuardHeld, NoopCriticalSection};
pub use lifecycle::{DeviceLifecycle, DeviceState};
pub use phy::{EndpointCapabilities, EndpointTypeMask, PhyEvent, UsbPhy};
pub use setup::{RequestDirection, RequestRecipient, RequestType, SetupPacket};
