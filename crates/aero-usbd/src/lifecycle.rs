use core::fmt;

/// USB device state (USB 2.0 §9.1). Ordered so that `state >= DeviceState::Default` reads as
/// "has seen a bus reset".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceState {
    Attached,
    Powered,
    Default,
    Address,
    Configured,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Attached => "attached",
            Self::Powered => "powered",
            Self::Default => "default",
            Self::Address => "address",
            Self::Configured => "configured",
        };
        f.write_str(s)
    }
}

/// Bus-visible device state owned by [`crate::UsbDevice`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceLifecycle {
    pub state: DeviceState,
    pub configuration: u8,
    pub address: u8,
    pub suspended: bool,
    /// DEVICE_REMOTE_WAKEUP feature, set by the host.
    pub remote_wakeup: bool,
}

impl DeviceLifecycle {
    pub fn new() -> Self {
        Self {
            state: DeviceState::Attached,
            configuration: 0,
            address: 0,
            suspended: false,
            remote_wakeup: false,
        }
    }

    pub fn configured(&self) -> bool {
        self.state == DeviceState::Configured
    }

    /// Bookkeeping that accompanies leaving `Configured` or falling back to `Default`.
    ///
    /// The address must already be assigned when entering `Address`.
    pub(crate) fn enter(&mut self, new_state: DeviceState) {
        debug_assert!(
            new_state != DeviceState::Address || self.address != 0,
            "Address state entered without a device address"
        );
        if self.state == DeviceState::Configured && new_state != DeviceState::Configured {
            self.configuration = 0;
        }
        if new_state <= DeviceState::Default {
            self.address = 0;
            self.remote_wakeup = false;
        }
        self.state = new_state;
    }
}

impl Default for DeviceLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
