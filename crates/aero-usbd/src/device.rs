use tracing::{debug, trace, warn};

use crate::class::{DeviceClass, RequestResult};
use crate::config::DeviceConfig;
use crate::control::{
    ControlStage, ControlTransfer, InPacket, PendingCallback, TransferDirection,
};
use crate::descriptor;
use crate::endpoint::{
    CallbackId, EndpointAddress, EndpointError, EndpointTable, EndpointType, Endpoints,
};
use crate::guard::{ConcurrencyGuard, CriticalSection};
use crate::lifecycle::{DeviceLifecycle, DeviceState};
use crate::phy::{EndpointCapabilities, PhyEvent, UsbPhy};
use crate::setup::SetupPacket;
use crate::standard::Dispatch;

/// Device side of a USB 2.0 peripheral: endpoint-0 control transfers, standard requests, device
/// state and the non-control endpoint table, layered over a [`UsbPhy`].
///
/// All mutation goes through `&mut self` methods that run under the [`ConcurrencyGuard`]. The PHY
/// events are delivered with [`UsbDevice::handle_event`] or drained with [`UsbDevice::process`].
pub struct UsbDevice<P: UsbPhy, C: DeviceClass> {
    pub(crate) phy: P,
    pub(crate) class: C,
    pub(crate) config: DeviceConfig,
    pub(crate) guard: ConcurrencyGuard,
    pub(crate) endpoints: EndpointTable,
    pub(crate) transfer: ControlTransfer,
    pub(crate) lifecycle: DeviceLifecycle,
    pub(crate) max_packet_size_ep0: u16,
    initialized: bool,
    connected: bool,
    sof_enabled: bool,
    /// A SETUP packet arrived and has not been processed yet.
    setup_ready: bool,
    /// An abort was requested while a class completion was outstanding.
    abort_control: bool,
    /// Completion owed from before a bus reset; dropped when it arrives.
    stale_callback: PendingCallback,
    /// SET_ADDRESS value, applied once the status stage completes.
    pub(crate) pending_address: Option<u8>,
    pub(crate) current_interface: u16,
    pub(crate) current_alternate: u8,
}

impl<P: UsbPhy, C: DeviceClass> UsbDevice<P, C> {
    pub fn new(phy: P, class: C, config: DeviceConfig) -> Self {
        Self::with_guard(phy, class, config, ConcurrencyGuard::default())
    }

    pub fn with_critical_section(
        phy: P,
        class: C,
        config: DeviceConfig,
        section: impl CriticalSection + Send + Sync + 'static,
    ) -> Self {
        Self::with_guard(phy, class, config, ConcurrencyGuard::new(section))
    }

    fn with_guard(phy: P, class: C, config: DeviceConfig, guard: ConcurrencyGuard) -> Self {
        let max_packet_size_ep0 = config.ep0_packet_size();
        Self {
            phy,
            class,
            config,
            guard,
            endpoints: EndpointTable::new(),
            transfer: ControlTransfer::new(),
            lifecycle: DeviceLifecycle::new(),
            max_packet_size_ep0,
            initialized: false,
            connected: false,
            sof_enabled: false,
            setup_ready: false,
            abort_control: false,
            stale_callback: PendingCallback::None,
            pending_address: None,
            current_interface: 0,
            current_alternate: 0,
        }
    }

    /// Runs `f` while holding the guard. Nested calls only bump the depth counter.
    fn with_lock<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let guard = self.guard.clone();
        let _held = guard.hold();
        f(self)
    }

    // ---------------------------------------------------------------------
    // Lifecycle API
    // ---------------------------------------------------------------------

    /// Initialises the PHY and negotiates the endpoint 0 packet size.
    pub fn init(&mut self) {
        self.with_lock(|dev| {
            if dev.initialized {
                return;
            }
            dev.phy.init();
            let requested = dev.config.ep0_packet_size();
            dev.max_packet_size_ep0 = dev.phy.ep0_set_max_packet(requested).max(8);
            dev.initialized = true;
            debug!(max_packet_size_ep0 = dev.max_packet_size_ep0, "USB device initialised");
            if dev.phy.powered() {
                dev.change_state(DeviceState::Powered);
            }
        })
    }

    pub fn deinit(&mut self) {
        self.with_lock(|dev| {
            if !dev.initialized {
                return;
            }
            dev.disconnect_locked();
            dev.change_state(DeviceState::Attached);
            dev.phy.deinit();
            dev.initialized = false;
        })
    }

    /// Enables the pull-up so the host can enumerate the device, initialising first if needed.
    pub fn connect(&mut self) {
        self.init();
        self.with_lock(|dev| {
            dev.connected = true;
            dev.phy.connect();
        })
    }

    pub fn disconnect(&mut self) {
        self.with_lock(|dev| dev.disconnect_locked())
    }

    fn disconnect_locked(&mut self) {
        self.guard.assert_locked();
        self.connected = false;
        self.phy.disconnect();
        if self.lifecycle.state > DeviceState::Powered {
            self.change_state(DeviceState::Powered);
        }
    }

    pub fn sof_enable(&mut self) {
        self.with_lock(|dev| {
            dev.sof_enabled = true;
            dev.phy.sof_enable();
        })
    }

    pub fn sof_disable(&mut self) {
        self.with_lock(|dev| {
            dev.sof_enabled = false;
            dev.phy.sof_disable();
        })
    }

    /// Signals resume to the host. Returns `false` if the host has not enabled remote wakeup.
    pub fn remote_wakeup(&mut self) -> bool {
        self.with_lock(|dev| {
            if !dev.lifecycle.remote_wakeup || !dev.lifecycle.suspended {
                return false;
            }
            dev.phy.remote_wakeup();
            true
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn configured(&self) -> bool {
        self.lifecycle.configured()
    }

    pub fn state(&self) -> DeviceState {
        self.lifecycle.state
    }

    pub fn address(&self) -> u8 {
        self.lifecycle.address
    }

    pub fn configuration(&self) -> u8 {
        self.lifecycle.configuration
    }

    pub fn suspended(&self) -> bool {
        self.lifecycle.suspended
    }

    pub fn lifecycle(&self) -> &DeviceLifecycle {
        &self.lifecycle
    }

    pub fn control_stage(&self) -> ControlStage {
        self.transfer.stage
    }

    /// Class completion the engine is waiting for, if any.
    pub fn pending_callback(&self) -> PendingCallback {
        self.transfer.user_callback
    }

    pub fn max_packet_size_ep0(&self) -> u16 {
        self.max_packet_size_ep0
    }

    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Endpoint types supported by the PHY, per endpoint number.
    pub fn endpoint_table(&self) -> EndpointCapabilities {
        self.phy.endpoint_capabilities()
    }

    pub fn registered_endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    /// First descriptor of `descriptor_type` inside the class's configuration descriptor.
    pub fn find_descriptor(&self, descriptor_type: u8) -> Option<Vec<u8>> {
        let config = self.class.configuration_descriptor()?;
        descriptor::find_descriptor(&config, descriptor_type).map(<[u8]>::to_vec)
    }

    pub fn class(&self) -> &C {
        &self.class
    }

    pub fn class_mut(&mut self) -> &mut C {
        &mut self.class
    }

    pub fn phy(&self) -> &P {
        &self.phy
    }

    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    pub(crate) fn change_state(&mut self, new_state: DeviceState) {
        self.guard.assert_locked();
        let old_state = self.lifecycle.state;
        if old_state == new_state {
            return;
        }

        if old_state == DeviceState::Configured {
            Endpoints::new(&mut self.endpoints, &mut self.phy).remove_all();
            self.current_interface = 0;
            self.current_alternate = 0;
        }
        if old_state >= DeviceState::Default && new_state < DeviceState::Default {
            self.control_reset();
        }

        self.lifecycle.enter(new_state);
        debug!(from = %old_state, to = %new_state, "USB device state change");
        self.class.state_change(new_state);
    }

    // ---------------------------------------------------------------------
    // Endpoint API
    // ---------------------------------------------------------------------

    pub fn endpoint_add(
        &mut self,
        endpoint: EndpointAddress,
        max_packet: u16,
        ty: EndpointType,
        callback: Option<CallbackId>,
    ) -> Result<(), EndpointError> {
        self.with_lock(|dev| dev.endpoint_handle().add(endpoint, max_packet, ty, callback))
    }

    pub fn endpoint_remove(&mut self, endpoint: EndpointAddress) -> Result<(), EndpointError> {
        self.with_lock(|dev| dev.endpoint_handle().remove(endpoint))
    }

    pub fn endpoint_stall(&mut self, endpoint: EndpointAddress) -> Result<(), EndpointError> {
        self.with_lock(|dev| dev.endpoint_handle().stall(endpoint))
    }

    pub fn endpoint_unstall(&mut self, endpoint: EndpointAddress) -> Result<(), EndpointError> {
        self.with_lock(|dev| dev.endpoint_handle().unstall(endpoint))
    }

    pub fn endpoint_max_packet_size(
        &self,
        endpoint: EndpointAddress,
    ) -> Result<u16, EndpointError> {
        Ok(self.endpoints.get(endpoint)?.max_packet_size())
    }

    pub fn read_start(&mut self, endpoint: EndpointAddress) -> Result<(), EndpointError> {
        self.with_lock(|dev| dev.endpoint_handle().read_start(endpoint))
    }

    pub fn read_finish(
        &mut self,
        endpoint: EndpointAddress,
        buf: &mut [u8],
    ) -> Result<Option<usize>, EndpointError> {
        self.with_lock(|dev| dev.endpoint_handle().read_finish(endpoint, buf))
    }

    pub fn write(&mut self, endpoint: EndpointAddress, data: &[u8]) -> Result<(), EndpointError> {
        self.with_lock(|dev| dev.endpoint_handle().write(endpoint, data))
    }

    fn endpoint_handle(&mut self) -> Endpoints<'_> {
        self.guard.assert_locked();
        Endpoints::new(&mut self.endpoints, &mut self.phy)
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    /// Delivers one PHY event. Events must not be delivered concurrently with each other.
    pub fn handle_event(&mut self, event: PhyEvent) {
        self.with_lock(|dev| dev.dispatch_event(event))
    }

    /// Drains and handles every event queued by the PHY.
    pub fn process(&mut self) {
        self.with_lock(|dev| {
            while let Some(event) = dev.phy.poll_event() {
                dev.dispatch_event(event);
            }
        })
    }

    fn dispatch_event(&mut self, event: PhyEvent) {
        self.guard.assert_locked();
        if !self.initialized {
            warn!(?event, "ignoring USB event before init");
            return;
        }
        match event {
            PhyEvent::Power(powered) => self.class.power(powered),
            PhyEvent::Suspend(suspended) => {
                self.lifecycle.suspended = suspended;
                self.class.suspend(suspended);
            }
            PhyEvent::Sof(frame_number) => {
                if self.sof_enabled {
                    self.class.sof(frame_number);
                }
            }
            PhyEvent::Reset => self.on_reset(),
            PhyEvent::Ep0Setup => self.on_ep0_setup(),
            PhyEvent::Ep0Out => self.on_ep0_out(),
            PhyEvent::Ep0In => self.on_ep0_in(),
            PhyEvent::Out(endpoint) | PhyEvent::In(endpoint) => self.on_endpoint_event(endpoint),
        }
    }

    fn on_reset(&mut self) {
        debug!("USB bus reset");
        self.class.reset();
        self.change_state(DeviceState::Default);
        Endpoints::new(&mut self.endpoints, &mut self.phy).abort_pending();
        self.lifecycle.suspended = false;
        self.lifecycle.address = 0;
        self.lifecycle.remote_wakeup = false;
        self.control_reset();
    }

    fn on_endpoint_event(&mut self, endpoint: EndpointAddress) {
        match self.endpoints.complete_transfer(endpoint) {
            None => warn!(%endpoint, "endpoint event without a pending transfer"),
            Some(None) => trace!(%endpoint, "endpoint transfer complete"),
            Some(Some(callback)) => {
                let mut endpoints = Endpoints::new(&mut self.endpoints, &mut self.phy);
                self.class.endpoint_event(&mut endpoints, endpoint, callback);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Control transfers
    // ---------------------------------------------------------------------

    fn on_ep0_setup(&mut self) {
        if self.lifecycle.state < DeviceState::Default {
            warn!(state = %self.lifecycle.state, "SETUP before bus reset ignored");
            return;
        }
        self.setup_ready = true;
        if self.stale_callback != PendingCallback::None {
            debug!(stale = ?self.stale_callback, "new SETUP supersedes pre-reset completion");
            self.stale_callback = PendingCallback::None;
        }
        self.control_abort_start();
    }

    /// Discards the control pipe immediately, along with any SETUP still waiting on the class.
    /// An owed class completion is remembered so that it is dropped on arrival.
    fn control_reset(&mut self) {
        self.guard.assert_locked();
        if self.transfer.user_callback != PendingCallback::None {
            self.stale_callback = self.transfer.user_callback;
        }
        if !self.transfer.is_idle() {
            debug!(stage = ?self.transfer.stage, "control transfer reset");
        }
        self.setup_ready = false;
        self.abort_control = false;
        self.transfer.reset();
        self.pending_address = None;
    }

    /// Aborts the current control transfer, or defers the abort until the outstanding class
    /// completion arrives.
    fn control_abort_start(&mut self) {
        if self.transfer.user_callback != PendingCallback::None {
            debug!(pending = ?self.transfer.user_callback, "deferring control abort");
            self.abort_control = true;
            return;
        }
        self.control_abort();
    }

    fn control_abort(&mut self) {
        self.guard.assert_locked();
        self.abort_control = false;
        if !self.transfer.is_idle() {
            debug!(stage = ?self.transfer.stage, "control transfer aborted");
        }
        self.transfer.reset();
        self.pending_address = None;

        if self.setup_ready {
            self.setup_ready = false;
            self.control_setup();
        }
    }

    fn control_setup(&mut self) {
        let setup = SetupPacket::from_bytes(self.phy.ep0_setup_read_result());
        trace!(
            bm_request_type = setup.bm_request_type,
            request = setup.b_request,
            value = setup.w_value,
            index = setup.w_index,
            length = setup.w_length,
            "SETUP"
        );
        self.transfer.begin(setup);

        match self.dispatch_standard() {
            Dispatch::Send(data) => self.control_send(data, false),
            Dispatch::Success => self.control_status_start(),
            Dispatch::Pending => {}
            Dispatch::Stall => self.control_stall(),
            Dispatch::Forward => {
                self.transfer.user_callback = PendingCallback::Request;
                if let Some(result) = self.class.request(&setup) {
                    self.transfer.user_callback = PendingCallback::None;
                    self.finish_request(result);
                }
            }
        }
    }

    fn finish_request(&mut self, result: RequestResult) {
        match result {
            RequestResult::Send(data) => self.control_send(data, true),
            RequestResult::Receive(len) => {
                if !self.transfer.start_receive(len, true) {
                    warn!(len, w_length = self.transfer.setup.w_length, "invalid OUT data stage");
                    self.control_stall();
                    return;
                }
                let len = self.transfer.next_out_len(self.max_packet_size_ep0 as usize);
                self.phy.ep0_read(len);
            }
            RequestResult::Success => {
                if self.transfer.setup.has_data_stage() {
                    warn!("request with a data stage completed without data");
                    self.control_stall();
                    return;
                }
                self.control_status_start();
            }
            RequestResult::Failure | RequestResult::PassThrough => self.control_stall(),
        }
    }

    fn control_send(&mut self, data: Vec<u8>, notify: bool) {
        if !self.transfer.start_send(data, self.max_packet_size_ep0 as usize, notify) {
            warn!(request = self.transfer.setup.b_request, "IN data for a request without one");
            self.control_stall();
            return;
        }
        self.control_in();
    }

    fn control_in(&mut self) {
        match self.transfer.next_in_packet(self.max_packet_size_ep0 as usize) {
            InPacket::Data(range) => {
                trace!(len = range.len(), "ep0 IN");
                self.phy.ep0_write(&self.transfer.buffer[range]);
            }
            InPacket::Zlp => {
                trace!("ep0 IN ZLP");
                self.phy.ep0_write(&[]);
            }
            InPacket::Done => self.control_data_done(),
        }
    }

    fn control_out(&mut self) {
        let max_packet = self.max_packet_size_ep0 as usize;
        let len = self.phy.ep0_read_result(self.transfer.out_window());
        trace!(len, "ep0 OUT");
        if !self.transfer.accept_out(len, max_packet) {
            warn!(len, remaining = self.transfer.remaining, "unexpected ep0 OUT packet size");
            self.control_stall();
            return;
        }
        if self.transfer.remaining == 0 {
            self.control_data_done();
        } else {
            let next = self.transfer.next_out_len(max_packet);
            self.phy.ep0_read(next);
        }
    }

    fn control_data_done(&mut self) {
        if !self.transfer.notify {
            self.control_xfer_done(true);
            return;
        }
        self.transfer.user_callback = PendingCallback::RequestXferDone;
        let setup = self.transfer.setup;
        if let Some(success) = self.class.request_xfer_done(&setup, self.transfer.data()) {
            self.transfer.user_callback = PendingCallback::None;
            self.control_xfer_done(success);
        }
    }

    fn control_xfer_done(&mut self, success: bool) {
        if success {
            self.control_status_start();
        } else {
            self.control_stall();
        }
    }

    fn control_status_start(&mut self) {
        self.transfer.stage = ControlStage::Status;
        match self.transfer.direction {
            // Host acknowledges IN data with an OUT ZLP.
            Some(TransferDirection::Send) => self.phy.ep0_read(0),
            _ => self.phy.ep0_write(&[]),
        }
    }

    fn control_status_done(&mut self, status_in: bool) {
        trace!(request = self.transfer.setup.b_request, "control transfer complete");
        let address = self.pending_address.take();
        self.transfer.reset();

        if let (true, Some(address)) = (status_in, address) {
            self.phy.set_address(address);
            let state = if address == 0 {
                DeviceState::Default
            } else {
                DeviceState::Address
            };
            self.lifecycle.address = address;
            self.change_state(state);
            debug!(address, "USB address set");
        }
    }

    fn control_stall(&mut self) {
        warn!(
            request = self.transfer.setup.b_request,
            bm_request_type = self.transfer.setup.bm_request_type,
            stage = ?self.transfer.stage,
            "stalling endpoint 0"
        );
        self.phy.ep0_stall();
        self.transfer.reset();
        self.pending_address = None;
    }

    fn on_ep0_out(&mut self) {
        match self.transfer.stage {
            ControlStage::DataOut => self.control_out(),
            ControlStage::Status if self.transfer.direction == Some(TransferDirection::Send) => {
                let _ = self.phy.ep0_read_result(&mut []);
                self.control_status_done(false);
            }
            ControlStage::Status => {
                warn!(request = self.transfer.setup.b_request, "OUT token during IN status stage");
                self.phy.ep0_stall();
                self.control_abort_start();
            }
            ControlStage::DataIn => {
                // Host moved to the status stage before reading all the data.
                let _ = self.phy.ep0_read_result(&mut []);
                debug!(sent = self.transfer.offset, "IN data stage ended early by host");
                self.transfer.reset();
            }
            ControlStage::Setup => {
                warn!("unexpected ep0 OUT");
                self.phy.ep0_stall();
                self.control_abort_start();
            }
        }
    }

    fn on_ep0_in(&mut self) {
        match self.transfer.stage {
            ControlStage::DataIn => self.control_in(),
            ControlStage::Status => self.control_status_done(true),
            stage => {
                warn!(?stage, "unexpected ep0 IN");
                self.phy.ep0_stall();
                self.control_abort_start();
            }
        }
    }

    /// Runs a deferred abort. Returns `true` if the completion call must be dropped.
    fn take_deferred_abort(&mut self) -> bool {
        if self.stale_callback != PendingCallback::None {
            debug!(stale = ?self.stale_callback, "dropping completion owed from before reset");
            self.stale_callback = PendingCallback::None;
            return true;
        }
        if self.abort_control {
            self.control_abort();
            return true;
        }
        false
    }

    fn expect_callback(&mut self, expected: PendingCallback) -> bool {
        if self.transfer.user_callback != expected {
            warn!(
                ?expected,
                pending = ?self.transfer.user_callback,
                "completion without a matching pending callback"
            );
            return false;
        }
        self.transfer.user_callback = PendingCallback::None;
        true
    }

    /// Completes a [`DeviceClass::request`] that returned `None`.
    pub fn complete_request(&mut self, result: RequestResult) {
        self.with_lock(|dev| {
            if dev.take_deferred_abort() || !dev.expect_callback(PendingCallback::Request) {
                return;
            }
            dev.finish_request(result);
        })
    }

    /// Completes a [`DeviceClass::request_xfer_done`] that returned `None`.
    pub fn complete_request_xfer_done(&mut self, success: bool) {
        self.with_lock(|dev| {
            if dev.take_deferred_abort() || !dev.expect_callback(PendingCallback::RequestXferDone) {
                return;
            }
            dev.control_xfer_done(success);
        })
    }

    /// Completes a [`DeviceClass::set_configuration`] that returned `None`.
    pub fn complete_set_configuration(&mut self, success: bool) {
        self.with_lock(|dev| {
            if dev.take_deferred_abort()
                || !dev.expect_callback(PendingCallback::SetConfiguration)
            {
                return;
            }
            let success = dev.apply_set_configuration(success);
            dev.control_xfer_done(success);
        })
    }

    /// Completes a [`DeviceClass::set_interface`] that returned `None`.
    pub fn complete_set_interface(&mut self, success: bool) {
        self.with_lock(|dev| {
            if dev.take_deferred_abort() || !dev.expect_callback(PendingCallback::SetInterface) {
                return;
            }
            let success = dev.apply_set_interface(success);
            dev.control_xfer_done(success);
        })
    }
}

impl<P: UsbPhy + core::fmt::Debug, C: DeviceClass> core::fmt::Debug for UsbDevice<P, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UsbDevice")
            .field("phy", &self.phy)
            .field("lifecycle", &self.lifecycle)
            .field("stage", &self.transfer.stage)
            .field("pending", &self.transfer.user_callback)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}
