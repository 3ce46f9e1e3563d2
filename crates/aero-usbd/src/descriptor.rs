//! Descriptor constants and helpers shared by the standard request handlers and device classes.

use crate::config::DeviceConfig;

pub const USB_DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const USB_DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub const USB_DESCRIPTOR_TYPE_STRING: u8 = 0x03;
pub const USB_DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const USB_DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
pub const CONFIGURATION_DESCRIPTOR_LEN: usize = 9;

pub const STRING_INDEX_LANGID: u8 = 0;
pub const STRING_INDEX_MANUFACTURER: u8 = 1;
pub const STRING_INDEX_PRODUCT: u8 = 2;
pub const STRING_INDEX_SERIAL: u8 = 3;
pub const STRING_INDEX_CONFIGURATION: u8 = 4;
pub const STRING_INDEX_INTERFACE: u8 = 5;

/// `bcdUSB` reported by the default device descriptor (USB 2.0).
const BCD_USB_2_0: u16 = 0x0200;

/// Builds a string descriptor with the UTF-16LE encoding of `s`.
///
/// String descriptors are limited to 255 bytes; longer strings are truncated on a code unit
/// boundary.
pub fn string_descriptor_utf16le(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + s.len() * 2);
    out.push(0); // bLength filled in later
    out.push(USB_DESCRIPTOR_TYPE_STRING);
    for ch in s.encode_utf16() {
        if out.len() + 2 > u8::MAX as usize {
            break;
        }
        out.extend_from_slice(&ch.to_le_bytes());
    }
    out[0] = out.len() as u8;
    out
}

/// String descriptor zero: the list of supported language IDs.
pub fn string_descriptor_langid(langid: u16) -> [u8; 4] {
    let [lo, hi] = langid.to_le_bytes();
    [4, USB_DESCRIPTOR_TYPE_STRING, lo, hi]
}

/// Builds the 18-byte device descriptor advertised when the device class does not supply one.
///
/// String indices are only populated for strings that are present in `config`.
pub fn default_device_descriptor(config: &DeviceConfig, max_packet_size_ep0: u8) -> [u8; 18] {
    let [usb0, usb1] = BCD_USB_2_0.to_le_bytes();
    let [vid0, vid1] = config.vendor_id.to_le_bytes();
    let [pid0, pid1] = config.product_id.to_le_bytes();
    let [rel0, rel1] = config.product_release.to_le_bytes();
    let index_if = |present: bool, index: u8| if present { index } else { 0 };
    [
        DEVICE_DESCRIPTOR_LEN as u8,
        USB_DESCRIPTOR_TYPE_DEVICE,
        usb0,
        usb1,
        0x00, // bDeviceClass: per interface
        0x00,
        0x00,
        max_packet_size_ep0,
        vid0,
        vid1,
        pid0,
        pid1,
        rel0,
        rel1,
        index_if(config.manufacturer.is_some(), STRING_INDEX_MANUFACTURER),
        index_if(config.product.is_some(), STRING_INDEX_PRODUCT),
        index_if(config.serial_number.is_some(), STRING_INDEX_SERIAL),
        1, // bNumConfigurations
    ]
}

/// Returns `wTotalLength` of a configuration descriptor, or `None` if `desc` is not one.
pub fn configuration_total_length(desc: &[u8]) -> Option<usize> {
    if desc.len() < CONFIGURATION_DESCRIPTOR_LEN || desc[1] != USB_DESCRIPTOR_TYPE_CONFIGURATION {
        return None;
    }
    Some(u16::from_le_bytes([desc[2], desc[3]]) as usize)
}

/// Checks that `desc` starts with a well-formed device descriptor header.
pub fn is_device_descriptor(desc: &[u8]) -> bool {
    desc.len() >= DEVICE_DESCRIPTOR_LEN
        && desc[0] as usize == DEVICE_DESCRIPTOR_LEN
        && desc[1] == USB_DESCRIPTOR_TYPE_DEVICE
}

/// Walks a configuration descriptor (including its trailing interface/endpoint/class descriptors)
/// and returns the first descriptor of `descriptor_type`.
///
/// The walk stops at `wTotalLength`, at the end of `config`, or at a malformed zero-length entry.
pub fn find_descriptor(config: &[u8], descriptor_type: u8) -> Option<&[u8]> {
    let total = configuration_total_length(config)?.min(config.len());
    let mut offset = 0usize;
    while offset + 2 <= total {
        let len = config[offset] as usize;
        if len < 2 || offset + len > total {
            return None;
        }
        if config[offset + 1] == descriptor_type {
            return Some(&config[offset..offset + len]);
        }
        offset += len;
    }
    None
}
