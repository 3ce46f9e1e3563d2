//! Device-class interface: the collaborator that supplies descriptors and handles class requests.

use crate::endpoint::{CallbackId, EndpointAddress, Endpoints};
use crate::lifecycle::DeviceState;
use crate::setup::SetupPacket;

/// Outcome of a device-class request handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestResult {
    /// Receive exactly this many bytes from the host (OUT data stage). Must equal `wLength`.
    Receive(usize),
    /// Send these bytes to the host (IN data stage). Truncated to `wLength`.
    Send(Vec<u8>),
    /// No data stage; proceed to the status stage.
    Success,
    /// Stall endpoint 0.
    Failure,
    /// Not handled by the class; fall back to the standard handling.
    PassThrough,
}

/// Callbacks from the device engine into a USB device class.
///
/// Methods returning an `Option` may complete synchronously by returning `Some`, or return `None`
/// and later call the matching `complete_*` method on [`crate::UsbDevice`]. Endpoint 0 is NAKed by
/// the PHY while a completion is outstanding.
pub trait DeviceClass {
    fn state_change(&mut self, new_state: DeviceState);

    /// Handles a SETUP request the engine did not resolve.
    ///
    /// Completion: [`crate::UsbDevice::complete_request`].
    fn request(&mut self, setup: &SetupPacket) -> Option<RequestResult>;

    /// Called after the data stage of a request the class accepted with
    /// [`RequestResult::Send`] or [`RequestResult::Receive`]. `data` holds the received bytes for
    /// OUT transfers and the sent bytes for IN transfers.
    ///
    /// Completion: [`crate::UsbDevice::complete_request_xfer_done`].
    fn request_xfer_done(&mut self, setup: &SetupPacket, data: &[u8]) -> Option<bool>;

    /// Selects configuration `configuration` (0 deconfigures). Endpoints for the new
    /// configuration are added through `endpoints`.
    ///
    /// Completion: [`crate::UsbDevice::complete_set_configuration`].
    fn set_configuration(&mut self, endpoints: &mut Endpoints<'_>, configuration: u8)
        -> Option<bool>;

    /// Completion: [`crate::UsbDevice::complete_set_interface`].
    fn set_interface(
        &mut self,
        endpoints: &mut Endpoints<'_>,
        interface: u16,
        alternate: u8,
    ) -> Option<bool>;

    fn power(&mut self, _powered: bool) {}

    fn sof(&mut self, _frame_number: u16) {}

    fn reset(&mut self) {}

    fn suspend(&mut self, _suspended: bool) {}

    /// A transfer on an endpoint registered with `callback` has completed.
    fn endpoint_event(
        &mut self,
        _endpoints: &mut Endpoints<'_>,
        _endpoint: EndpointAddress,
        _callback: CallbackId,
    ) {
    }

    fn device_descriptor(&self) -> Option<Vec<u8>> {
        None
    }

    /// Full configuration descriptor, including interface and endpoint descriptors.
    fn configuration_descriptor(&self) -> Option<Vec<u8>> {
        None
    }

    fn string_langid_descriptor(&self) -> Option<Vec<u8>> {
        None
    }

    fn string_manufacturer_descriptor(&self) -> Option<Vec<u8>> {
        None
    }

    fn string_product_descriptor(&self) -> Option<Vec<u8>> {
        None
    }

    fn string_serial_descriptor(&self) -> Option<Vec<u8>> {
        None
    }

    fn string_configuration_descriptor(&self) -> Option<Vec<u8>> {
        None
    }

    fn string_interface_descriptor(&self) -> Option<Vec<u8>> {
        None
    }
}
