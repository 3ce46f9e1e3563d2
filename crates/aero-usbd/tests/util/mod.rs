#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};

use aero_usbd::{
    CallbackId, ControlStage, DeviceClass, DeviceConfig, DeviceState, EndpointAddress,
    EndpointCapabilities, EndpointType, Endpoints, PhyEvent, RequestResult, SetupPacket, UsbDevice,
    UsbPhy,
};

pub const BULK_IN: EndpointAddress = EndpointAddress::in_ep(1);
pub const BULK_OUT: EndpointAddress = EndpointAddress::out_ep(1);
pub const BULK_IN_CALLBACK: CallbackId = CallbackId(1);
pub const BULK_OUT_CALLBACK: CallbackId = CallbackId(2);

/// Scripted PHY that records everything the device asks of the hardware.
#[derive(Debug)]
pub struct MockPhy {
    pub powered: bool,
    pub initialized: bool,
    pub connected: bool,
    pub configured: bool,
    pub sof_enabled: bool,
    pub remote_wakeups: usize,
    /// Largest ep0 packet size the hardware accepts.
    pub ep0_max_packet: u16,
    pub address: Option<u8>,
    pub setup: [u8; 8],
    pub ep0_writes: Vec<Vec<u8>>,
    pub ep0_reads: Vec<usize>,
    pub ep0_stalls: usize,
    /// Packets handed out by `ep0_read_result`, oldest first.
    pub ep0_out_data: VecDeque<Vec<u8>>,
    pub capabilities: EndpointCapabilities,
    pub reject_endpoint_add: bool,
    pub hw_endpoints: HashMap<EndpointAddress, (u16, EndpointType)>,
    pub hw_stalled: Vec<EndpointAddress>,
    pub endpoint_reads: Vec<EndpointAddress>,
    pub endpoint_writes: Vec<(EndpointAddress, Vec<u8>)>,
    pub endpoint_out_data: HashMap<EndpointAddress, Vec<u8>>,
    pub endpoint_aborts: Vec<EndpointAddress>,
    pub events: VecDeque<PhyEvent>,
}

impl MockPhy {
    pub fn new() -> Self {
        Self {
            powered: true,
            initialized: false,
            connected: false,
            configured: false,
            sof_enabled: false,
            remote_wakeups: 0,
            ep0_max_packet: 64,
            address: None,
            setup: [0; 8],
            ep0_writes: Vec::new(),
            ep0_reads: Vec::new(),
            ep0_stalls: 0,
            ep0_out_data: VecDeque::new(),
            capabilities: EndpointCapabilities::all(),
            reject_endpoint_add: false,
            hw_endpoints: HashMap::new(),
            hw_stalled: Vec::new(),
            endpoint_reads: Vec::new(),
            endpoint_writes: Vec::new(),
            endpoint_out_data: HashMap::new(),
            endpoint_aborts: Vec::new(),
            events: VecDeque::new(),
        }
    }

    pub fn take_ep0_writes(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.ep0_writes)
    }
}

impl Default for MockPhy {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbPhy for MockPhy {
    fn init(&mut self) {
        self.initialized = true;
    }

    fn deinit(&mut self) {
        self.initialized = false;
    }

    fn powered(&self) -> bool {
        self.powered
    }

    fn connect(&mut self) {
        self.connected = true;
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn configure(&mut self) {
        self.configured = true;
    }

    fn unconfigure(&mut self) {
        self.configured = false;
    }

    fn sof_enable(&mut self) {
        self.sof_enabled = true;
    }

    fn sof_disable(&mut self) {
        self.sof_enabled = false;
    }

    fn set_address(&mut self, address: u8) {
        self.address = Some(address);
    }

    fn remote_wakeup(&mut self) {
        self.remote_wakeups += 1;
    }

    fn endpoint_capabilities(&self) -> EndpointCapabilities {
        self.capabilities.clone()
    }

    fn ep0_set_max_packet(&mut self, max_packet: u16) -> u16 {
        max_packet.min(self.ep0_max_packet)
    }

    fn ep0_setup_read_result(&mut self) -> [u8; 8] {
        self.setup
    }

    fn ep0_read(&mut self, max_len: usize) {
        self.ep0_reads.push(max_len);
    }

    fn ep0_read_result(&mut self, buf: &mut [u8]) -> usize {
        let packet = self.ep0_out_data.pop_front().unwrap_or_default();
        let copied = packet.len().min(buf.len());
        buf[..copied].copy_from_slice(&packet[..copied]);
        packet.len()
    }

    fn ep0_write(&mut self, data: &[u8]) {
        self.ep0_writes.push(data.to_vec());
    }

    fn ep0_stall(&mut self) {
        self.ep0_stalls += 1;
    }

    fn endpoint_add(
        &mut self,
        endpoint: EndpointAddress,
        max_packet: u16,
        ty: EndpointType,
    ) -> bool {
        if self.reject_endpoint_add {
            return false;
        }
        self.hw_endpoints.insert(endpoint, (max_packet, ty));
        true
    }

    fn endpoint_remove(&mut self, endpoint: EndpointAddress) {
        self.hw_endpoints.remove(&endpoint);
    }

    fn endpoint_stall(&mut self, endpoint: EndpointAddress) {
        if !self.hw_stalled.contains(&endpoint) {
            self.hw_stalled.push(endpoint);
        }
    }

    fn endpoint_unstall(&mut self, endpoint: EndpointAddress) {
        self.hw_stalled.retain(|&ep| ep != endpoint);
    }

    fn endpoint_read(&mut self, endpoint: EndpointAddress, _max_packet: u16) -> bool {
        self.endpoint_reads.push(endpoint);
        true
    }

    fn endpoint_read_result(&mut self, endpoint: EndpointAddress, buf: &mut [u8]) -> usize {
        let data = self.endpoint_out_data.remove(&endpoint).unwrap_or_default();
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        len
    }

    fn endpoint_write(&mut self, endpoint: EndpointAddress, data: &[u8]) -> bool {
        self.endpoint_writes.push((endpoint, data.to_vec()));
        true
    }

    fn endpoint_abort(&mut self, endpoint: EndpointAddress) {
        self.endpoint_aborts.push(endpoint);
    }

    fn poll_event(&mut self) -> Option<PhyEvent> {
        self.events.pop_front()
    }
}

/// Device class with scripted replies. A `None` reply defers completion to the test.
#[derive(Debug)]
pub struct TestClass {
    pub request_reply: Option<RequestResult>,
    pub xfer_done_reply: Option<bool>,
    pub set_configuration_reply: Option<bool>,
    pub set_interface_reply: Option<bool>,
    pub device_descriptor: Option<Vec<u8>>,
    pub configuration_descriptor: Option<Vec<u8>>,
    pub product_string: Option<Vec<u8>>,
    /// Endpoints added when a non-zero configuration is selected.
    pub config_endpoints: Vec<(EndpointAddress, u16, EndpointType, Option<CallbackId>)>,
    /// Re-arm OUT endpoints from `endpoint_event`.
    pub rearm_reads: bool,
    pub panic_on_request: bool,

    pub states: Vec<DeviceState>,
    pub requests: Vec<SetupPacket>,
    pub xfer_done: Vec<(SetupPacket, Vec<u8>)>,
    pub configurations: Vec<u8>,
    pub interfaces: Vec<(u16, u8)>,
    pub power: Vec<bool>,
    pub sofs: Vec<u16>,
    pub resets: usize,
    pub suspends: Vec<bool>,
    pub endpoint_events: Vec<(EndpointAddress, CallbackId)>,
}

impl TestClass {
    pub fn new() -> Self {
        Self {
            request_reply: Some(RequestResult::PassThrough),
            xfer_done_reply: Some(true),
            set_configuration_reply: Some(true),
            set_interface_reply: Some(true),
            device_descriptor: None,
            configuration_descriptor: Some(sample_configuration_descriptor()),
            product_string: None,
            config_endpoints: vec![
                (BULK_IN, 64, EndpointType::Bulk, Some(BULK_IN_CALLBACK)),
                (BULK_OUT, 64, EndpointType::Bulk, Some(BULK_OUT_CALLBACK)),
            ],
            rearm_reads: false,
            panic_on_request: false,
            states: Vec::new(),
            requests: Vec::new(),
            xfer_done: Vec::new(),
            configurations: Vec::new(),
            interfaces: Vec::new(),
            power: Vec::new(),
            sofs: Vec::new(),
            resets: 0,
            suspends: Vec::new(),
            endpoint_events: Vec::new(),
        }
    }
}

impl Default for TestClass {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceClass for TestClass {
    fn state_change(&mut self, new_state: DeviceState) {
        self.states.push(new_state);
    }

    fn request(&mut self, setup: &SetupPacket) -> Option<RequestResult> {
        self.requests.push(*setup);
        if self.panic_on_request {
            panic!("class request handler failed");
        }
        self.request_reply.clone()
    }

    fn request_xfer_done(&mut self, setup: &SetupPacket, data: &[u8]) -> Option<bool> {
        self.xfer_done.push((*setup, data.to_vec()));
        self.xfer_done_reply
    }

    fn set_configuration(
        &mut self,
        endpoints: &mut Endpoints<'_>,
        configuration: u8,
    ) -> Option<bool> {
        self.configurations.push(configuration);
        if configuration != 0 {
            for &(ep, max_packet, ty, callback) in &self.config_endpoints {
                if endpoints.add(ep, max_packet, ty, callback).is_err() {
                    return Some(false);
                }
            }
        }
        self.set_configuration_reply
    }

    fn set_interface(
        &mut self,
        _endpoints: &mut Endpoints<'_>,
        interface: u16,
        alternate: u8,
    ) -> Option<bool> {
        self.interfaces.push((interface, alternate));
        self.set_interface_reply
    }

    fn power(&mut self, powered: bool) {
        self.power.push(powered);
    }

    fn sof(&mut self, frame_number: u16) {
        self.sofs.push(frame_number);
    }

    fn reset(&mut self) {
        self.resets += 1;
    }

    fn suspend(&mut self, suspended: bool) {
        self.suspends.push(suspended);
    }

    fn endpoint_event(
        &mut self,
        endpoints: &mut Endpoints<'_>,
        endpoint: EndpointAddress,
        callback: CallbackId,
    ) {
        self.endpoint_events.push((endpoint, callback));
        if self.rearm_reads && !endpoint.is_in() {
            let _ = endpoints.read_start(endpoint);
        }
    }

    fn device_descriptor(&self) -> Option<Vec<u8>> {
        self.device_descriptor.clone()
    }

    fn configuration_descriptor(&self) -> Option<Vec<u8>> {
        self.configuration_descriptor.clone()
    }

    fn string_product_descriptor(&self) -> Option<Vec<u8>> {
        self.product_string.clone()
    }
}

pub type TestDevice = UsbDevice<MockPhy, TestClass>;

/// Configuration 1 with one interface and a bulk IN/OUT pair on endpoint 1 (32 bytes).
pub fn sample_configuration_descriptor() -> Vec<u8> {
    vec![
        9, 0x02, 32, 0, 1, 1, 0, 0x80, 50, //
        9, 0x04, 0, 0, 2, 0xff, 0, 0, 0, //
        7, 0x05, 0x81, 0x02, 64, 0, 0, //
        7, 0x05, 0x01, 0x02, 64, 0, 0,
    ]
}

pub fn setup_packet(
    bm_request_type: u8,
    b_request: u8,
    w_value: u16,
    w_index: u16,
    w_length: u16,
) -> SetupPacket {
    SetupPacket {
        bm_request_type,
        b_request,
        w_value,
        w_index,
        w_length,
    }
}

/// Connected device that has seen a bus reset (Default state).
pub fn reset_device(class: TestClass) -> TestDevice {
    reset_device_with_config(class, DeviceConfig::default())
}

pub fn reset_device_with_config(class: TestClass, config: DeviceConfig) -> TestDevice {
    let mut dev = UsbDevice::new(MockPhy::new(), class, config);
    dev.connect();
    dev.handle_event(PhyEvent::Reset);
    dev
}

/// Device in the Address state at address 5.
pub fn addressed_device(class: TestClass) -> TestDevice {
    let mut dev = reset_device(class);
    assert!(control_no_data(&mut dev, setup_packet(0x00, 0x05, 5, 0, 0)));
    assert_eq!(dev.state(), DeviceState::Address);
    dev
}

/// Device in configuration 1 with the bulk endpoints registered.
pub fn configured_device(class: TestClass) -> TestDevice {
    let mut dev = addressed_device(class);
    assert!(control_no_data(&mut dev, setup_packet(0x00, 0x09, 1, 0, 0)));
    assert_eq!(dev.state(), DeviceState::Configured);
    dev
}

pub fn send_setup(dev: &mut TestDevice, setup: SetupPacket) {
    dev.phy_mut().setup = setup.to_bytes();
    dev.handle_event(PhyEvent::Ep0Setup);
}

/// Runs a control transfer without a data stage. Returns `false` if endpoint 0 stalled.
pub fn control_no_data(dev: &mut TestDevice, setup: SetupPacket) -> bool {
    let stalls = dev.phy().ep0_stalls;
    dev.phy_mut().ep0_writes.clear();
    send_setup(dev, setup);
    if dev.control_stage() != ControlStage::Status {
        return false;
    }
    assert_eq!(dev.phy_mut().take_ep0_writes(), vec![Vec::<u8>::new()]);
    dev.handle_event(PhyEvent::Ep0In);
    dev.phy().ep0_stalls == stalls
}

/// Runs an IN control transfer, acknowledging every packet. Returns the individual packets, or
/// `None` if endpoint 0 stalled.
pub fn control_in_packets(dev: &mut TestDevice, setup: SetupPacket) -> Option<Vec<Vec<u8>>> {
    let stalls = dev.phy().ep0_stalls;
    dev.phy_mut().ep0_writes.clear();
    send_setup(dev, setup);

    let mut packets = Vec::new();
    for _ in 0..1024 {
        packets.extend(dev.phy_mut().take_ep0_writes());
        if dev.control_stage() != ControlStage::DataIn {
            break;
        }
        dev.handle_event(PhyEvent::Ep0In);
    }
    if dev.phy().ep0_stalls != stalls || dev.control_stage() != ControlStage::Status {
        return None;
    }

    // Status stage: OUT ZLP from the host.
    assert_eq!(dev.phy().ep0_reads.last(), Some(&0));
    dev.handle_event(PhyEvent::Ep0Out);
    assert_eq!(dev.control_stage(), ControlStage::Setup);
    Some(packets)
}

pub fn control_in(dev: &mut TestDevice, setup: SetupPacket) -> Option<Vec<u8>> {
    control_in_packets(dev, setup).map(|packets| packets.concat())
}

/// Runs an OUT control transfer, splitting `data` into ep0-sized packets. Returns `false` if
/// endpoint 0 stalled.
pub fn control_out(dev: &mut TestDevice, setup: SetupPacket, data: &[u8]) -> bool {
    let stalls = dev.phy().ep0_stalls;
    send_setup(dev, setup);
    let max_packet = dev.max_packet_size_ep0() as usize;
    for chunk in data.chunks(max_packet) {
        if dev.control_stage() != ControlStage::DataOut {
            return false;
        }
        dev.phy_mut().ep0_out_data.push_back(chunk.to_vec());
        dev.handle_event(PhyEvent::Ep0Out);
    }
    if dev.control_stage() != ControlStage::Status {
        return false;
    }
    dev.phy_mut().ep0_writes.clear();
    dev.handle_event(PhyEvent::Ep0In);
    dev.phy().ep0_stalls == stalls
}
