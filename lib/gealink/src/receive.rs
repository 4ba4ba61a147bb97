//! Shared receive accumulator: rebuilds one packet at a time from the
//! byte stream, validating length, CRC and addressing on ETX.
//!
//! The buffer is owned by the interrupt context while `packet_ready` is
//! false and by the background while it is true. The interrupt side never
//! touches the buffer once the flag is raised; the background clears the
//! flag only after publication.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::crc16;
use crate::frame::{self, BroadcastRule, Packet};

/// Outcome of feeding one byte to the accumulator.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Event {
    None,
    /// A valid packet is buffered and `packet_ready` has been raised.
    Complete { destination: u8 },
}

pub struct Receiver {
    buffer: Vec<u8>,
    count: usize,
    crc: u16,
    escaped: bool,
    stx_seen: bool,
    require_stx: bool,
    address: u8,
    ignore_destination_address: bool,
    broadcast: BroadcastRule,
    packet_ready: AtomicBool,
}

impl Receiver {
    pub fn new(
        capacity: usize,
        address: u8,
        ignore_destination_address: bool,
        broadcast: BroadcastRule,
        require_stx: bool,
    ) -> Receiver {
        Receiver {
            buffer: vec![0; capacity],
            count: 0,
            crc: crc16::SEED,
            escaped: false,
            stx_seen: false,
            require_stx,
            address,
            ignore_destination_address,
            broadcast,
            packet_ready: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn packet_ready(&self) -> bool {
        self.packet_ready.load(Ordering::Acquire)
    }

    /// Returns the buffer to the interrupt context. Call only after the
    /// packet has been published.
    #[inline]
    pub fn finish_publication(&self) {
        self.packet_ready.store(false, Ordering::Release);
    }

    /// View of the buffered packet. Valid only while `packet_ready`.
    #[inline]
    pub fn packet(&self) -> Packet<'_> {
        Packet::new(&self.buffer[..self.count])
    }

    /// Restarts the accumulator for a new frame.
    #[inline]
    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn process(&mut self, byte: u8) -> Event {
        if self.packet_ready() {
            return Event::None;
        }

        if self.escaped {
            self.escaped = false;
            self.buffer_byte(byte);
            return Event::None;
        }

        match byte {
            frame::ESC => self.escaped = true,

            frame::STX => {
                self.count = 0;
                self.stx_seen = true;
            }

            frame::ETX => {
                let valid = (!self.require_stx || self.stx_seen) && self.validate();
                self.stx_seen = false;

                if valid {
                    self.buffer[frame::PAYLOAD_LENGTH_OFFSET] -= frame::TRANSMISSION_OVERHEAD as u8;

                    let destination = self.buffer[frame::DESTINATION_OFFSET];
                    self.packet_ready.store(true, Ordering::Release);

                    return Event::Complete { destination };
                }
            }

            _ => self.buffer_byte(byte),
        }

        Event::None
    }

    #[inline]
    fn buffer_byte(&mut self, byte: u8) {
        if self.count == 0 {
            self.crc = crc16::SEED;
        }

        if self.count < self.buffer.len() {
            self.buffer[self.count] = byte;
            self.count += 1;
            self.crc = crc16::byte(self.crc, byte);
        }
    }

    fn validate(&self) -> bool {
        self.has_minimum_length() && self.has_valid_length() && self.crc == 0 && self.addressed_to_me()
    }

    #[inline]
    fn has_minimum_length(&self) -> bool {
        self.count >= frame::CRC_SIZE + frame::PAYLOAD_OFFSET
    }

    #[inline]
    fn has_valid_length(&self) -> bool {
        self.buffer[frame::PAYLOAD_LENGTH_OFFSET] as usize == self.count + frame::UNBUFFERED_BYTES
    }

    #[inline]
    fn addressed_to_me(&self) -> bool {
        let destination = self.buffer[frame::DESTINATION_OFFSET];

        destination == self.address
            || self.broadcast.matches(destination)
            || self.ignore_destination_address
    }
}
