//! Standard request handling (USB 2.0 §9.4).
//!
//! Requests are resolved here first. Anything the engine cannot answer on its own (class and
//! vendor requests, unknown descriptor types, interface-directed GET_DESCRIPTOR) is forwarded to
//! the device class exactly once.

use tracing::{debug, warn};

use crate::class::DeviceClass;
use crate::control::PendingCallback;
use crate::descriptor::{
    self, STRING_INDEX_CONFIGURATION, STRING_INDEX_INTERFACE, STRING_INDEX_LANGID,
    STRING_INDEX_MANUFACTURER, STRING_INDEX_PRODUCT, STRING_INDEX_SERIAL,
    USB_DESCRIPTOR_TYPE_CONFIGURATION, USB_DESCRIPTOR_TYPE_DEVICE, USB_DESCRIPTOR_TYPE_STRING,
};
use crate::device::UsbDevice;
use crate::endpoint::{EndpointAddress, Endpoints};
use crate::lifecycle::DeviceState;
use crate::phy::UsbPhy;
use crate::setup::{
    RequestDirection, RequestRecipient, SetupPacket, USB_FEATURE_DEVICE_REMOTE_WAKEUP,
    USB_FEATURE_ENDPOINT_HALT, USB_REQUEST_CLEAR_FEATURE, USB_REQUEST_GET_CONFIGURATION,
    USB_REQUEST_GET_DESCRIPTOR, USB_REQUEST_GET_INTERFACE, USB_REQUEST_GET_STATUS,
    USB_REQUEST_SET_ADDRESS, USB_REQUEST_SET_CONFIGURATION, USB_REQUEST_SET_FEATURE,
    USB_REQUEST_SET_INTERFACE,
};

/// Offset of `bConfigurationValue` in a configuration descriptor.
const CONFIGURATION_VALUE_OFFSET: usize = 5;

/// How the engine proceeds after the standard dispatcher looked at a SETUP packet.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// Answer with an IN data stage.
    Send(Vec<u8>),
    /// Go straight to the status stage.
    Success,
    /// A class completion is outstanding.
    Pending,
    Stall,
    /// Not a request the engine resolves; hand it to the device class.
    Forward,
}

impl From<bool> for Dispatch {
    fn from(success: bool) -> Self {
        if success {
            Dispatch::Success
        } else {
            Dispatch::Stall
        }
    }
}

fn is_in(setup: &SetupPacket) -> bool {
    setup.request_direction() == RequestDirection::DeviceToHost
}

/// Host-to-device request without a data stage.
fn is_plain_out(setup: &SetupPacket) -> bool {
    !is_in(setup) && setup.w_length == 0
}

impl<P: UsbPhy, C: DeviceClass> UsbDevice<P, C> {
    pub(crate) fn dispatch_standard(&mut self) -> Dispatch {
        self.guard.assert_locked();
        let setup = self.transfer.setup;
        if !setup.is_standard() {
            return Dispatch::Forward;
        }

        match self.lifecycle.state {
            DeviceState::Default => {
                if !matches!(
                    setup.b_request,
                    USB_REQUEST_GET_DESCRIPTOR | USB_REQUEST_SET_ADDRESS
                ) {
                    warn!(request = setup.b_request, "request not allowed in the default state");
                    return Dispatch::Stall;
                }
            }
            DeviceState::Address => {
                let rejected = match setup.recipient() {
                    RequestRecipient::Interface => true,
                    RequestRecipient::Endpoint => (setup.w_index & 0x7f) != 0,
                    _ => false,
                };
                if rejected {
                    warn!(request = setup.b_request, "request not allowed in the address state");
                    return Dispatch::Stall;
                }
            }
            _ => {}
        }

        match setup.b_request {
            USB_REQUEST_GET_STATUS => self.get_status(&setup),
            USB_REQUEST_CLEAR_FEATURE => self.feature(&setup, false),
            USB_REQUEST_SET_FEATURE => self.feature(&setup, true),
            USB_REQUEST_SET_ADDRESS => self.set_address(&setup),
            USB_REQUEST_GET_DESCRIPTOR => self.get_descriptor(&setup),
            USB_REQUEST_GET_CONFIGURATION => self.get_configuration(&setup),
            USB_REQUEST_SET_CONFIGURATION => self.set_configuration(&setup),
            USB_REQUEST_GET_INTERFACE => self.get_interface(&setup),
            USB_REQUEST_SET_INTERFACE => self.set_interface(&setup),
            _ => Dispatch::Forward,
        }
    }

    fn get_status(&mut self, setup: &SetupPacket) -> Dispatch {
        if !is_in(setup) || setup.w_value != 0 || setup.w_length != 2 {
            return Dispatch::Stall;
        }
        let status: u16 = match setup.recipient() {
            RequestRecipient::Device => {
                u16::from(self.config.self_powered) | (u16::from(self.lifecycle.remote_wakeup) << 1)
            }
            RequestRecipient::Interface => 0,
            RequestRecipient::Endpoint => {
                let Some(endpoint) = endpoint_from_index(setup.w_index) else {
                    return Dispatch::Stall;
                };
                if endpoint.is_control() {
                    0
                } else {
                    match self.endpoints.get(endpoint) {
                        Ok(record) => u16::from(record.is_stalled()),
                        Err(_) => return Dispatch::Stall,
                    }
                }
            }
            _ => return Dispatch::Stall,
        };
        Dispatch::Send(status.to_le_bytes().to_vec())
    }

    fn feature(&mut self, setup: &SetupPacket, set: bool) -> Dispatch {
        if !is_plain_out(setup) {
            return Dispatch::Stall;
        }
        match (setup.recipient(), setup.w_value) {
            (RequestRecipient::Device, USB_FEATURE_DEVICE_REMOTE_WAKEUP) => {
                self.lifecycle.remote_wakeup = set;
                debug!(enabled = set, "remote wakeup");
                Dispatch::Success
            }
            (RequestRecipient::Endpoint, USB_FEATURE_ENDPOINT_HALT) => {
                let Some(endpoint) = endpoint_from_index(setup.w_index) else {
                    return Dispatch::Stall;
                };
                if endpoint.is_control() {
                    // Endpoint 0 cannot be halted through SET_FEATURE.
                    return (!set).into();
                }
                let mut endpoints = Endpoints::new(&mut self.endpoints, &mut self.phy);
                let result = if set {
                    endpoints.stall(endpoint)
                } else {
                    endpoints.unstall(endpoint)
                };
                result.is_ok().into()
            }
            // TEST_MODE and unknown selectors.
            _ => Dispatch::Stall,
        }
    }

    fn set_address(&mut self, setup: &SetupPacket) -> Dispatch {
        let state = self.lifecycle.state;
        if !matches!(state, DeviceState::Default | DeviceState::Address)
            || setup.recipient() != RequestRecipient::Device
            || !is_plain_out(setup)
            || setup.w_index != 0
            || setup.w_value > 127
        {
            return Dispatch::Stall;
        }
        self.pending_address = Some(setup.w_value as u8);
        Dispatch::Success
    }

    fn get_descriptor(&mut self, setup: &SetupPacket) -> Dispatch {
        if !is_in(setup) {
            return Dispatch::Stall;
        }
        if setup.recipient() != RequestRecipient::Device {
            return Dispatch::Forward;
        }

        let index = setup.descriptor_index();
        let desc = match setup.descriptor_type() {
            USB_DESCRIPTOR_TYPE_DEVICE => Some(self.class.device_descriptor().unwrap_or_else(|| {
                descriptor::default_device_descriptor(&self.config, self.max_packet_size_ep0 as u8)
                    .to_vec()
            })),
            USB_DESCRIPTOR_TYPE_CONFIGURATION if index == 0 => {
                self.class.configuration_descriptor().map(|mut desc| {
                    if let Some(total) = descriptor::configuration_total_length(&desc) {
                        desc.truncate(total);
                    }
                    desc
                })
            }
            USB_DESCRIPTOR_TYPE_CONFIGURATION => None,
            USB_DESCRIPTOR_TYPE_STRING => match index {
                STRING_INDEX_LANGID => Some(self.class.string_langid_descriptor().unwrap_or_else(
                    || descriptor::string_descriptor_langid(self.config.language_id).to_vec(),
                )),
                STRING_INDEX_MANUFACTURER => string_or_default(
                    self.class.string_manufacturer_descriptor(),
                    self.config.manufacturer.as_deref(),
                ),
                STRING_INDEX_PRODUCT => string_or_default(
                    self.class.string_product_descriptor(),
                    self.config.product.as_deref(),
                ),
                STRING_INDEX_SERIAL => string_or_default(
                    self.class.string_serial_descriptor(),
                    self.config.serial_number.as_deref(),
                ),
                STRING_INDEX_CONFIGURATION => string_or_default(
                    self.class.string_configuration_descriptor(),
                    self.config.configuration_name.as_deref(),
                ),
                STRING_INDEX_INTERFACE => string_or_default(
                    self.class.string_interface_descriptor(),
                    self.config.interface_name.as_deref(),
                ),
                _ => return Dispatch::Forward,
            },
            _ => return Dispatch::Forward,
        };

        match desc {
            Some(desc) => Dispatch::Send(desc),
            None => {
                warn!(value = setup.w_value, "descriptor not available");
                Dispatch::Stall
            }
        }
    }

    fn get_configuration(&mut self, setup: &SetupPacket) -> Dispatch {
        if !matches!(
            self.lifecycle.state,
            DeviceState::Address | DeviceState::Configured
        ) || !is_in(setup)
            || setup.recipient() != RequestRecipient::Device
            || setup.w_length != 1
        {
            return Dispatch::Stall;
        }
        Dispatch::Send(vec![self.lifecycle.configuration])
    }

    fn set_configuration(&mut self, setup: &SetupPacket) -> Dispatch {
        if !matches!(
            self.lifecycle.state,
            DeviceState::Address | DeviceState::Configured
        ) || setup.recipient() != RequestRecipient::Device
            || !is_plain_out(setup)
            || setup.w_value > 0xff
        {
            return Dispatch::Stall;
        }
        let configuration = setup.w_value as u8;
        if configuration != 0 {
            if let Some(desc) = self.class.configuration_descriptor() {
                if desc.get(CONFIGURATION_VALUE_OFFSET) != Some(&configuration) {
                    warn!(configuration, "unknown configuration value");
                    return Dispatch::Stall;
                }
            }
        }

        self.transfer.user_callback = PendingCallback::SetConfiguration;
        let mut endpoints = Endpoints::new(&mut self.endpoints, &mut self.phy);
        match self.class.set_configuration(&mut endpoints, configuration) {
            Some(success) => {
                self.transfer.user_callback = PendingCallback::None;
                self.apply_set_configuration(success).into()
            }
            None => Dispatch::Pending,
        }
    }

    /// Applies a SET_CONFIGURATION the class accepted. Returns whether the request succeeded.
    pub(crate) fn apply_set_configuration(&mut self, success: bool) -> bool {
        if !success {
            // Drop whatever the class registered for the rejected configuration.
            if self.lifecycle.state != DeviceState::Configured {
                Endpoints::new(&mut self.endpoints, &mut self.phy).remove_all();
            }
            return false;
        }
        let configuration = self.transfer.setup.w_value as u8;
        if configuration == 0 {
            self.phy.unconfigure();
            self.change_state(DeviceState::Address);
        } else {
            self.phy.configure();
            self.lifecycle.configuration = configuration;
            self.change_state(DeviceState::Configured);
        }
        self.current_interface = 0;
        self.current_alternate = 0;
        debug!(configuration, "configuration set");
        true
    }

    fn get_interface(&mut self, setup: &SetupPacket) -> Dispatch {
        if self.lifecycle.state != DeviceState::Configured
            || !is_in(setup)
            || setup.recipient() != RequestRecipient::Interface
            || setup.w_length != 1
        {
            return Dispatch::Stall;
        }
        let alternate = if setup.w_index == self.current_interface {
            self.current_alternate
        } else {
            0
        };
        Dispatch::Send(vec![alternate])
    }

    fn set_interface(&mut self, setup: &SetupPacket) -> Dispatch {
        if self.lifecycle.state != DeviceState::Configured
            || setup.recipient() != RequestRecipient::Interface
            || !is_plain_out(setup)
            || setup.w_value > 0xff
        {
            return Dispatch::Stall;
        }

        self.transfer.user_callback = PendingCallback::SetInterface;
        let mut endpoints = Endpoints::new(&mut self.endpoints, &mut self.phy);
        match self
            .class
            .set_interface(&mut endpoints, setup.w_index, setup.w_value as u8)
        {
            Some(success) => {
                self.transfer.user_callback = PendingCallback::None;
                self.apply_set_interface(success).into()
            }
            None => Dispatch::Pending,
        }
    }

    pub(crate) fn apply_set_interface(&mut self, success: bool) -> bool {
        if success {
            self.current_interface = self.transfer.setup.w_index;
            self.current_alternate = self.transfer.setup.w_value as u8;
        }
        success
    }
}

fn string_or_default(class_desc: Option<Vec<u8>>, fallback: Option<&str>) -> Option<Vec<u8>> {
    class_desc.or_else(|| fallback.map(descriptor::string_descriptor_utf16le))
}

fn endpoint_from_index(w_index: u16) -> Option<EndpointAddress> {
    let endpoint = EndpointAddress::from_raw(u8::try_from(w_index).ok()?);
    endpoint.is_well_formed().then_some(endpoint)
}
