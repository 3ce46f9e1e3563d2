//! SETUP packet decoding (USB 2.0 §9.3).

use serde::{Deserialize, Serialize};

pub const SETUP_PACKET_LEN: usize = 8;

pub const USB_REQUEST_GET_STATUS: u8 = 0x00;
pub const USB_REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const USB_REQUEST_SET_FEATURE: u8 = 0x03;
pub const USB_REQUEST_SET_ADDRESS: u8 = 0x05;
pub const USB_REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const USB_REQUEST_SET_DESCRIPTOR: u8 = 0x07;
pub const USB_REQUEST_GET_CONFIGURATION: u8 = 0x08;
pub const USB_REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const USB_REQUEST_GET_INTERFACE: u8 = 0x0a;
pub const USB_REQUEST_SET_INTERFACE: u8 = 0x0b;

pub const USB_FEATURE_ENDPOINT_HALT: u16 = 0x0000;
pub const USB_FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 0x0001;
pub const USB_FEATURE_TEST_MODE: u16 = 0x0002;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestDirection {
    HostToDevice,
    DeviceToHost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved(u8),
}

/// An 8-byte USB SETUP packet as received on endpoint 0.
///
/// Multi-byte fields are little-endian on the wire. The packet is immutable once decoded and is
/// owned by the control pipe for the duration of a single control transfer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    #[serde(rename = "bmRequestType")]
    pub bm_request_type: u8,
    #[serde(rename = "bRequest")]
    pub b_request: u8,
    #[serde(rename = "wValue")]
    pub w_value: u16,
    #[serde(rename = "wIndex")]
    pub w_index: u16,
    #[serde(rename = "wLength")]
    pub w_length: u16,
}

impl SetupPacket {
    pub fn from_bytes(bytes: [u8; SETUP_PACKET_LEN]) -> Self {
        Self {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
            w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
            w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_LEN] {
        let [v0, v1] = self.w_value.to_le_bytes();
        let [i0, i1] = self.w_index.to_le_bytes();
        let [l0, l1] = self.w_length.to_le_bytes();
        [self.bm_request_type, self.b_request, v0, v1, i0, i1, l0, l1]
    }

    pub fn request_direction(&self) -> RequestDirection {
        if (self.bm_request_type & 0x80) != 0 {
            RequestDirection::DeviceToHost
        } else {
            RequestDirection::HostToDevice
        }
    }

    pub fn request_type(&self) -> RequestType {
        match (self.bm_request_type >> 5) & 0x03 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> RequestRecipient {
        match self.bm_request_type & 0x1f {
            0 => RequestRecipient::Device,
            1 => RequestRecipient::Interface,
            2 => RequestRecipient::Endpoint,
            3 => RequestRecipient::Other,
            other => RequestRecipient::Reserved(other),
        }
    }

    /// Descriptor type carried in the high byte of `wValue` (GET_DESCRIPTOR).
    pub fn descriptor_type(&self) -> u8 {
        (self.w_value >> 8) as u8
    }

    /// Descriptor index carried in the low byte of `wValue` (GET_DESCRIPTOR).
    pub fn descriptor_index(&self) -> u8 {
        (self.w_value & 0x00ff) as u8
    }

    pub fn is_standard(&self) -> bool {
        self.request_type() == RequestType::Standard
    }

    pub fn has_data_stage(&self) -> bool {
        self.w_length != 0
    }
}

impl From<[u8; SETUP_PACKET_LEN]> for SetupPacket {
    fn from(bytes: [u8; SETUP_PACKET_LEN]) -> Self {
        Self::from_bytes(bytes)
    }
}
