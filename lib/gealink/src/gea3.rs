//! Full-duplex framer. No reflections, no collisions, no ACK: the UART
//! raises a send-complete interrupt after each byte and the transmit
//! machine is paced by that event alone.
//!
//! The interrupt context only peeks at the head of the send queue; the
//! background appends at the tail and discards the head once
//! `send.completed` reports the frame finished. While a send is in
//! progress the head record is immutable.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::Gea3Config;
use crate::crc16;
use crate::frame::{self, BroadcastRule, Packet, PacketMut};
use crate::interface::Interface;
use crate::logging;
use crate::queue::RecordQueue;
use crate::receive::Receiver;
use crate::uart::Uart;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SendState {
    Destination,
    PayloadLength,
    Source,
    Data,
    CrcMsb,
    CrcLsb,
    Etx,
    Complete,
}

struct Send {
    queue: RecordQueue,
    state: SendState,
    offset: usize,
    wire_length: u8,
    crc: u16,
    escaped: bool,
    in_progress: AtomicBool,
    completed: AtomicBool,
}

impl Send {
    #[inline]
    fn peek_byte(&self, offset: usize) -> u8 {
        let mut byte = [0u8; 1];
        self.queue.peek_partial(&mut byte, offset, 0);
        byte[0]
    }
}

pub struct Gea3<U: Uart> {
    uart: U,
    address: u8,
    receive: Receiver,
    send: Send,
    log: logging::Logger,
}

impl<U: Uart> Gea3<U> {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(uart: U, config: &Gea3Config, log: L) -> Gea3<U> {
        Gea3 {
            uart,
            address: config.address,
            receive: Receiver::new(
                config.receive_buffer_size,
                config.address,
                config.ignore_destination_address,
                BroadcastRule::Exact,
                true,
            ),
            send: Send {
                queue: RecordQueue::new(config.send_queue_size),
                state: SendState::Complete,
                offset: 0,
                wire_length: 0,
                crc: 0,
                escaped: false,
                in_progress: AtomicBool::new(false),
                completed: AtomicBool::new(false),
            },
            log: logging::child(log, "gea3"),
        }
    }

    /// Interrupt context: one byte arrived from the UART.
    pub fn on_byte_received(&mut self, byte: u8) {
        self.receive.process(byte);
    }

    /// Interrupt context: the UART finished shifting the previous byte
    /// out. Computes and drives the next byte of the active frame.
    pub fn on_send_complete(&mut self) {
        let byte_to_send = match self.send.state {
            SendState::Destination => {
                let pending = self.send.peek_byte(self.send.offset);
                self.advance(pending, SendState::PayloadLength)
            }

            SendState::PayloadLength => {
                let pending = self.send.wire_length;
                self.advance(pending, SendState::Source)
            }

            SendState::Source => {
                let pending = self.send.peek_byte(self.send.offset);
                let next = if self.send.wire_length as usize == frame::TRANSMISSION_OVERHEAD {
                    SendState::CrcMsb
                } else {
                    SendState::Data
                };
                self.advance(pending, next)
            }

            SendState::Data => {
                let pending = self.send.peek_byte(self.send.offset);
                let (byte, advanced) = frame::consider_escape(&mut self.send.escaped, pending);

                if advanced {
                    self.send.crc = crc16::byte(self.send.crc, pending);
                    self.send.offset += 1;

                    let buffered =
                        self.send.wire_length as usize - (frame::TRANSMISSION_OVERHEAD - frame::PACKET_OVERHEAD);
                    if self.send.offset >= buffered {
                        self.send.state = SendState::CrcMsb;
                    }
                }

                byte
            }

            SendState::CrcMsb => {
                let (byte, advanced) = frame::consider_escape(&mut self.send.escaped, (self.send.crc >> 8) as u8);
                if advanced {
                    self.send.state = SendState::CrcLsb;
                }
                byte
            }

            SendState::CrcLsb => {
                let (byte, advanced) = frame::consider_escape(&mut self.send.escaped, self.send.crc as u8);
                if advanced {
                    self.send.state = SendState::Etx;
                }
                byte
            }

            SendState::Etx => {
                self.send.state = SendState::Complete;
                frame::ETX
            }

            SendState::Complete => {
                // The frame is done; the queue head is released by run()
                self.send.completed.store(true, Ordering::Release);
                return;
            }
        };

        self.uart.send(byte_to_send);
    }

    /// Background step: publishes a pending packet, releases a finished
    /// frame and starts the next queued one.
    pub fn run<F: FnMut(Packet<'_>)>(&mut self, mut on_receive: F) {
        if self.receive.packet_ready() {
            on_receive(self.receive.packet());

            // Cleared only after publication so the buffer is not reused
            // by the interrupt context mid-callback.
            self.receive.finish_publication();
        }

        if self.send.completed.load(Ordering::Acquire) {
            self.send.queue.discard();
            self.send.completed.store(false, Ordering::Release);
            self.send.in_progress.store(false, Ordering::Release);
        }

        if !self.send.in_progress.load(Ordering::Acquire) && self.send.queue.count() > 0 {
            self.begin_send();
        }
    }

    pub fn send<F: FnOnce(&mut PacketMut)>(&mut self, destination: u8, payload_length: usize, fill: F) -> bool {
        self.send_worker(destination, payload_length, Some(self.address), fill)
    }

    pub fn forward<F: FnOnce(&mut PacketMut)>(&mut self, destination: u8, payload_length: usize, fill: F) -> bool {
        self.send_worker(destination, payload_length, None, fill)
    }

    #[inline]
    pub fn address(&self) -> u8 {
        self.address
    }

    fn send_worker<F: FnOnce(&mut PacketMut)>(
        &mut self,
        destination: u8,
        payload_length: usize,
        source: Option<u8>,
        fill: F,
    ) -> bool {
        if payload_length > frame::MAX_PAYLOAD_LENGTH {
            return false;
        }

        let size = frame::PACKET_OVERHEAD + payload_length;
        let mut scratch = [0u8; frame::PACKET_OVERHEAD + frame::MAX_PAYLOAD_LENGTH];

        frame::populate(&mut scratch[..size], destination, payload_length, source, fill);

        // Queued records carry the wire-form length byte so the transmit
        // machine never recomputes it.
        scratch[frame::PAYLOAD_LENGTH_OFFSET] = (payload_length + frame::TRANSMISSION_OVERHEAD) as u8;

        if !self.send.queue.enqueue(&scratch[..size]) {
            logging::debug!(self.log, "send rejected, queue full";
                            "destination" => destination,
                            "payload_length" => payload_length);
            return false;
        }

        if !self.send.in_progress.load(Ordering::Acquire) {
            self.begin_send();
        }

        true
    }

    fn begin_send(&mut self) {
        self.send.wire_length = self.send.peek_byte(frame::PAYLOAD_LENGTH_OFFSET);
        self.send.crc = crc16::SEED;
        self.send.state = SendState::Destination;
        self.send.offset = 0;
        self.send.escaped = false;
        self.send.in_progress.store(true, Ordering::Release);

        self.uart.send(frame::STX);
    }

    /// Drives `pending` through the escape logic, folding it into the CRC
    /// and stepping to `next` once the unescaped byte has gone out.
    #[inline]
    fn advance(&mut self, pending: u8, next: SendState) -> u8 {
        let (byte, advanced) = frame::consider_escape(&mut self.send.escaped, pending);

        if advanced {
            self.send.crc = crc16::byte(self.send.crc, pending);
            self.send.offset += 1;
            self.send.state = next;
        }

        byte
    }
}

impl<U: Uart> Interface for Gea3<U> {
    fn send<F: FnOnce(&mut PacketMut)>(&mut self, destination: u8, payload_length: usize, fill: F) -> bool {
        Gea3::send(self, destination, payload_length, fill)
    }

    fn forward<F: FnOnce(&mut PacketMut)>(&mut self, destination: u8, payload_length: usize, fill: F) -> bool {
        Gea3::forward(self, destination, payload_length, fill)
    }

    fn run<F: FnMut(Packet<'_>)>(&mut self, on_receive: F) {
        Gea3::run(self, on_receive)
    }

    fn address(&self) -> u8 {
        Gea3::address(self)
    }
}
