//! The contract every framer exposes to the layers above it.

use crate::frame::{Packet, PacketMut};

pub trait Interface {
    /// Queues a packet for transmission. `fill` writes the payload into
    /// the packet view; the framer stamps the destination and its own
    /// address as the source. Returns false when the packet cannot be
    /// accepted (oversized, or the send queue is full).
    fn send<F: FnOnce(&mut PacketMut)>(&mut self, destination: u8, payload_length: usize, fill: F) -> bool;

    /// Like [`send`](Interface::send), but the source address written by
    /// `fill` is preserved so packets can be relayed on behalf of other
    /// nodes.
    fn forward<F: FnOnce(&mut PacketMut)>(&mut self, destination: u8, payload_length: usize, fill: F) -> bool;

    /// Background step: publishes at most one received packet to
    /// `on_receive` and advances queued transmissions. Never blocks.
    fn run<F: FnMut(Packet<'_>)>(&mut self, on_receive: F);

    /// This node's bus address.
    fn address(&self) -> u8;
}
