use serde::{Deserialize, Serialize};

/// Largest control endpoint packet size allowed for full-speed devices.
pub const MAX_PACKET_SIZE_EP0: u16 = 64;

/// Static identity and defaults of a USB device.
///
/// The string fields are only used when the device class does not provide the corresponding
/// string descriptor itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// `bcdDevice`.
    pub product_release: u16,
    /// Requested endpoint 0 packet size. The PHY may negotiate a smaller value during `init`.
    pub max_packet_size_ep0: u16,
    /// Reported through GET_STATUS(device).
    pub self_powered: bool,
    pub language_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub configuration_name: Option<String>,
    pub interface_name: Option<String>,
}

impl DeviceConfig {
    pub fn new(vendor_id: u16, product_id: u16, product_release: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            product_release,
            ..Self::default()
        }
    }

    /// Requested ep0 packet size clamped to a legal USB 2.0 full-speed value (8, 16, 32 or 64).
    pub fn ep0_packet_size(&self) -> u16 {
        match self.max_packet_size_ep0 {
            0..=8 => 8,
            9..=16 => 16,
            17..=32 => 32,
            _ => MAX_PACKET_SIZE_EP0,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x1234,
            product_id: 0x0006,
            product_release: 0x0001,
            max_packet_size_ep0: MAX_PACKET_SIZE_EP0,
            self_powered: true,
            language_id: 0x0409, // en-US
            manufacturer: Some("Aero".to_string()),
            product: Some("Aero USB Device".to_string()),
            serial_number: Some("0123456789".to_string()),
            configuration_name: Some("Default".to_string()),
            interface_name: Some("Interface".to_string()),
        }
    }
}
