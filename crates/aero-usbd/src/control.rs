//! Endpoint-0 control transfer context.
//!
//! This module only tracks the bookkeeping of one control transfer (stage, buffer position, ZLP);
//! driving the PHY and the device class is done by [`crate::UsbDevice`].

use core::ops::Range;

use crate::setup::{RequestDirection, SetupPacket};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlStage {
    Setup,
    DataOut,
    DataIn,
    Status,
}

/// Direction of the data supplied for a transfer, from the device's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Device-class completion the engine is waiting for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PendingCallback {
    #[default]
    None,
    Request,
    RequestXferDone,
    SetConfiguration,
    SetInterface,
}

/// Next action of an IN data stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InPacket {
    /// Send `buffer[range]`.
    Data(Range<usize>),
    /// Send a zero-length packet to terminate a transfer shorter than `wLength`.
    Zlp,
    /// All packets have been acknowledged.
    Done,
}

/// Whether an IN data stage of `len` bytes must be terminated by a zero-length packet.
///
/// The host stops on a short packet or after `wLength` bytes. A transfer that is shorter than
/// `wLength` but ends on a packet boundary needs an explicit ZLP.
pub fn needs_zlp(len: usize, w_length: usize, max_packet: usize) -> bool {
    max_packet != 0 && len < w_length && len % max_packet == 0
}

/// Number of IN packets (including the ZLP) needed to send `len` bytes for a request of
/// `w_length`.
pub fn in_packet_count(len: usize, w_length: usize, max_packet: usize) -> usize {
    let len = len.min(w_length);
    len.div_ceil(max_packet) + usize::from(needs_zlp(len, w_length, max_packet))
}

#[derive(Clone, Debug)]
pub struct ControlTransfer {
    pub setup: SetupPacket,
    pub buffer: Vec<u8>,
    /// Bytes already sent or received.
    pub offset: usize,
    pub remaining: usize,
    pub direction: Option<TransferDirection>,
    pub zlp: bool,
    /// Call `DeviceClass::request_xfer_done` when the data stage ends.
    pub notify: bool,
    pub stage: ControlStage,
    pub user_callback: PendingCallback,
}

impl ControlTransfer {
    pub fn new() -> Self {
        Self {
            setup: SetupPacket::default(),
            buffer: Vec::new(),
            offset: 0,
            remaining: 0,
            direction: None,
            zlp: false,
            notify: false,
            stage: ControlStage::Setup,
            user_callback: PendingCallback::None,
        }
    }

    /// Forgets any in-flight transfer.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.offset = 0;
        self.remaining = 0;
        self.direction = None;
        self.zlp = false;
        self.notify = false;
        self.stage = ControlStage::Setup;
        self.user_callback = PendingCallback::None;
    }

    pub fn begin(&mut self, setup: SetupPacket) {
        self.reset();
        self.setup = setup;
    }

    pub fn is_idle(&self) -> bool {
        self.stage == ControlStage::Setup && self.user_callback == PendingCallback::None
    }

    /// Prepares an IN data stage. Returns `false` if the request has no IN data stage.
    pub fn start_send(&mut self, mut data: Vec<u8>, max_packet: usize, notify: bool) -> bool {
        let w_length = self.setup.w_length as usize;
        if self.setup.request_direction() != RequestDirection::DeviceToHost || w_length == 0 {
            return false;
        }
        data.truncate(w_length);
        self.zlp = needs_zlp(data.len(), w_length, max_packet);
        self.remaining = data.len();
        self.offset = 0;
        self.buffer = data;
        self.direction = Some(TransferDirection::Send);
        self.notify = notify;
        self.stage = ControlStage::DataIn;
        true
    }

    /// Prepares an OUT data stage of exactly `len` bytes.
    pub fn start_receive(&mut self, len: usize, notify: bool) -> bool {
        let w_length = self.setup.w_length as usize;
        if self.setup.request_direction() != RequestDirection::HostToDevice
            || w_length == 0
            || len != w_length
        {
            return false;
        }
        self.buffer = vec![0; len];
        self.remaining = len;
        self.offset = 0;
        self.direction = Some(TransferDirection::Receive);
        self.notify = notify;
        self.stage = ControlStage::DataOut;
        true
    }

    /// Advances an IN data stage by one packet.
    pub fn next_in_packet(&mut self, max_packet: usize) -> InPacket {
        if self.remaining == 0 {
            if self.zlp {
                self.zlp = false;
                return InPacket::Zlp;
            }
            return InPacket::Done;
        }
        let len = self.remaining.min(max_packet.max(1));
        let range = self.offset..self.offset + len;
        self.offset += len;
        self.remaining -= len;
        InPacket::Data(range)
    }

    /// Size to arm the next OUT packet with.
    pub fn next_out_len(&self, max_packet: usize) -> usize {
        self.remaining.min(max_packet)
    }

    /// Unfilled part of the OUT buffer.
    pub fn out_window(&mut self) -> &mut [u8] {
        let end = self.offset + self.remaining;
        &mut self.buffer[self.offset..end]
    }

    /// Accounts for an OUT packet of `len` bytes. Returns `false` if the packet does not fit the
    /// remaining byte count or ends the data stage early.
    pub fn accept_out(&mut self, len: usize, max_packet: usize) -> bool {
        if len > self.remaining || len < self.next_out_len(max_packet) {
            return false;
        }
        self.offset += len;
        self.remaining -= len;
        true
    }

    /// Bytes exchanged during the data stage.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.offset.min(self.buffer.len())]
    }
}

impl Default for ControlTransfer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_descriptor(w_length: u16) -> SetupPacket {
        SetupPacket {
            bm_request_type: 0x80,
            b_request: 0x06,
            w_value: 0x0200,
            w_index: 0,
            w_length,
        }
    }

    fn collect_in(transfer: &mut ControlTransfer, max_packet: usize) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        loop {
            match transfer.next_in_packet(max_packet) {
                InPacket::Data(range) => packets.push(transfer.buffer[range].to_vec()),
                InPacket::Zlp => packets.push(Vec::new()),
                InPacket::Done => return packets,
            }
        }
    }

    #[test]
    fn zlp_only_for_short_transfers_on_packet_boundary() {
        assert!(needs_zlp(64, 255, 64));
        assert!(!needs_zlp(64, 64, 64));
        assert!(!needs_zlp(65, 255, 64));
        assert!(needs_zlp(0, 8, 8));
    }

    #[test]
    fn send_is_truncated_to_w_length() {
        let mut transfer = ControlTransfer::new();
        transfer.begin(get_descriptor(18));
        assert!(transfer.start_send(vec![0xaa; 34], 8, false));

        let packets = collect_in(&mut transfer, 8);
        let lens: Vec<usize> = packets.iter().map(Vec::len).collect();
        assert_eq!(lens, vec![8, 8, 2]);
        assert_eq!(transfer.data().len(), 18);
    }

    #[test]
    fn boundary_transfer_ends_with_zlp() {
        let mut transfer = ControlTransfer::new();
        transfer.begin(get_descriptor(255));
        assert!(transfer.start_send(vec![1; 128], 64, false));

        let lens: Vec<usize> = collect_in(&mut transfer, 64).iter().map(Vec::len).collect();
        assert_eq!(lens, vec![64, 64, 0]);
        assert_eq!(in_packet_count(128, 255, 64), 3);
    }

    #[test]
    fn send_rejected_for_out_request() {
        let mut transfer = ControlTransfer::new();
        transfer.begin(SetupPacket {
            bm_request_type: 0x21,
            b_request: 0x09,
            w_value: 0,
            w_index: 0,
            w_length: 4,
        });
        assert!(!transfer.start_send(vec![0; 4], 64, true));
        assert!(transfer.start_receive(4, true));
        assert_eq!(transfer.stage, ControlStage::DataOut);
    }

    #[test]
    fn receive_requires_exact_length() {
        let mut transfer = ControlTransfer::new();
        transfer.begin(SetupPacket {
            bm_request_type: 0x21,
            b_request: 0x09,
            w_value: 0,
            w_index: 0,
            w_length: 10,
        });
        assert!(!transfer.start_receive(9, true));
        assert!(transfer.start_receive(10, true));

        transfer.out_window()[..8].copy_from_slice(&[1; 8]);
        assert!(transfer.accept_out(8, 8));
        assert_eq!(transfer.next_out_len(8), 2);
        assert!(!transfer.accept_out(3, 8));
        assert!(!transfer.accept_out(1, 8));
        assert!(transfer.accept_out(2, 8));
        assert_eq!(transfer.remaining, 0);
        assert_eq!(transfer.data().len(), 10);
    }

    #[test]
    fn reset_clears_pending_callback() {
        let mut transfer = ControlTransfer::new();
        transfer.user_callback = PendingCallback::Request;
        transfer.stage = ControlStage::Status;
        transfer.reset();
        assert!(transfer.is_idle());
    }
}
