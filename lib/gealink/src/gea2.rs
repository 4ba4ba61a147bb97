//! Single-wire half-duplex framer. The bus is shared and collision-prone:
//! every byte this node drives is reflected back by the hardware, and a
//! reflection that never arrives or does not match means another node was
//! transmitting at the same time. Transmissions back off for a
//! pseudo-random, address-keyed cooldown before retrying.
//!
//! `on_byte_received` and `on_msec_tick` run in the interrupt context;
//! `send`, `forward` and `run` belong to the background. The contexts
//! meet only at the atomic flags (`packet_ready`, `active`,
//! `packet_queued_in_background`); while a send is active the head of the
//! queue and the send buffer belong to the interrupt side.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::Gea2Config;
use crate::crc16;
use crate::frame::{self, BroadcastRule, Packet, PacketMut};
use crate::interface::Interface;
use crate::logging;
use crate::queue::RecordQueue;
use crate::receive::{Event, Receiver};
use crate::timer::{Ticks, Timer};
use crate::uart::Uart;

const REFLECTION_TIMEOUT_MSEC: Ticks = 6;
const ACK_TIMEOUT_MSEC: Ticks = 8;
const INTERBYTE_TIMEOUT_MSEC: Ticks = 6;

const BROADCAST: BroadcastRule = BroadcastRule::HighNibble;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum LinkState {
    Idle,
    Receive,
    IdleCooldown,
    Send,
    WaitForAck,
    CollisionCooldown,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SendState {
    Stx,
    Data,
    CrcMsb,
    CrcLsb,
    Etx,
    Done,
}

/// Noteworthy link events, drained by the background.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Diagnostic {
    PacketReceived,
    PacketSent,
    CollisionDetected,
    ReflectionTimedOut,
}

struct Send {
    buffer: Vec<u8>,
    queue: RecordQueue,
    state: SendState,
    offset: usize,
    crc: u16,
    escaped: bool,
    expected_reflection: u8,
    retries: u8,
    active: AtomicBool,
    packet_queued_in_background: AtomicBool,
}

pub struct Gea2<U: Uart> {
    uart: U,
    address: u8,
    retries: u8,
    state: LinkState,
    ticks: Ticks,
    timer: Timer,
    receive: Receiver,
    send: Send,
    diagnostics: Vec<Diagnostic>,
    log: logging::Logger,
}

#[inline]
fn idle_timeout(address: u8) -> Ticks {
    Ticks::from(10 + (address & 0x1F))
}

#[inline]
fn collision_timeout(address: u8, entropy: u8) -> Ticks {
    Ticks::from(43 + (address & 0x1F) + ((entropy ^ address) & 0x1F))
}

impl<U: Uart> Gea2<U> {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(uart: U, config: &Gea2Config, log: L) -> Gea2<U> {
        Gea2 {
            uart,
            address: config.address,
            retries: config.retries,
            state: LinkState::Idle,
            ticks: 0,
            timer: Timer::new(),
            receive: Receiver::new(
                config.receive_buffer_size,
                config.address,
                config.ignore_destination_address,
                BROADCAST,
                false,
            ),
            send: Send {
                buffer: vec![0; config.send_buffer_size],
                queue: RecordQueue::new(config.send_queue_size),
                state: SendState::Stx,
                offset: 0,
                crc: 0,
                escaped: false,
                expected_reflection: 0,
                retries: config.retries,
                active: AtomicBool::new(false),
                packet_queued_in_background: AtomicBool::new(false),
            },
            diagnostics: Vec::with_capacity(8),
            log: logging::child(log, "gea2"),
        }
    }

    /// Interrupt context: one byte observed on the wire. On a single-wire
    /// bus this includes the reflections of our own transmissions.
    pub fn on_byte_received(&mut self, byte: u8) {
        match self.state {
            LinkState::Idle => {
                if byte == frame::STX && !self.receive.packet_ready() {
                    self.transition(LinkState::Receive);
                } else {
                    self.transition(LinkState::IdleCooldown);
                }
            }

            LinkState::Receive => {
                self.timer.start(self.ticks, INTERBYTE_TIMEOUT_MSEC);

                if let Event::Complete { destination } = self.receive.process(byte) {
                    self.diagnostics.push(Diagnostic::PacketReceived);

                    if !BROADCAST.matches(destination) {
                        self.uart.send(frame::ACK);
                    }

                    self.transition(LinkState::IdleCooldown);
                }
            }

            LinkState::IdleCooldown => {
                if byte == frame::STX && !self.receive.packet_ready() {
                    self.transition(LinkState::Receive);
                } else {
                    // Traffic restarts the cooldown
                    self.transition(LinkState::IdleCooldown);
                }
            }

            LinkState::Send => {
                if byte == self.send.expected_reflection {
                    if self.send.state == SendState::Done {
                        self.finish_reflected_packet();
                    } else {
                        self.send_next_byte();
                    }
                } else {
                    logging::debug!(self.log, "collision detected";
                                    "expected" => self.send.expected_reflection,
                                    "observed" => byte);
                    self.diagnostics.push(Diagnostic::CollisionDetected);
                    self.handle_send_failure();
                }
            }

            LinkState::WaitForAck => {
                if byte == frame::ACK {
                    self.send.active.store(false, Ordering::Release);
                    self.diagnostics.push(Diagnostic::PacketSent);
                    self.transition(LinkState::IdleCooldown);
                } else {
                    self.handle_send_failure();
                }
            }

            LinkState::CollisionCooldown => {
                if byte == frame::STX {
                    if self.receive.packet_ready() {
                        self.transition(LinkState::IdleCooldown);
                    } else {
                        self.transition(LinkState::Receive);
                    }
                }
            }
        }
    }

    /// Interrupt context: the millisecond heartbeat. Latches packets the
    /// background prepared and drives every link timeout.
    pub fn on_msec_tick(&mut self) {
        self.ticks += 1;

        if self.send.packet_queued_in_background.load(Ordering::Acquire) {
            self.send.packet_queued_in_background.store(false, Ordering::Release);

            if self.state == LinkState::Idle && self.send.active.load(Ordering::Acquire) {
                self.transition(LinkState::Send);
            }
        }

        if self.timer.expire(self.ticks) {
            self.on_timeout();
        }
    }

    /// Background step: publishes a pending packet and feeds the state
    /// machine from the send queue once the active packet is done.
    pub fn run<F: FnMut(Packet<'_>)>(&mut self, mut on_receive: F) {
        if self.receive.packet_ready() {
            on_receive(self.receive.packet());

            // Cleared only after publication so the buffer is not reused
            // by the interrupt context mid-callback.
            self.receive.finish_publication();
        }

        if !self.send.active.load(Ordering::Acquire) && self.send.queue.count() > 0 {
            let send = &mut self.send;
            if send.queue.dequeue(&mut send.buffer).is_some() {
                self.prepare_transmission();
            }
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

    /// True while a packet is being transmitted or awaiting its turn on
    /// the state machine.
    #[inline]
    pub fn sending(&self) -> bool {
        self.send.active.load(Ordering::Acquire)
    }

    pub fn set_retries(&mut self, retries: u8) {
        self.retries = retries;
    }

    /// Drains the diagnostics accumulated since the last call.
    #[inline]
    pub fn diagnostics(&mut self) -> impl Iterator<Item = Diagnostic> + '_ {
        self.diagnostics.drain(..)
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
        if size > self.send.buffer.len() {
            logging::debug!(self.log, "send rejected, payload too large";
                            "payload_length" => payload_length,
                            "send_buffer_size" => self.send.buffer.len());
            return false;
        }

        if self.send.active.load(Ordering::Acquire) {
            let mut scratch = [0u8; frame::PACKET_OVERHEAD + frame::MAX_PAYLOAD_LENGTH];
            frame::populate(&mut scratch[..size], destination, payload_length, source, fill);
            self.send.queue.enqueue(&scratch[..size])
        } else {
            frame::populate(&mut self.send.buffer[..size], destination, payload_length, source, fill);
            self.prepare_transmission();
            true
        }
    }

    /// Converts the in-memory packet in the send buffer to its wire form
    /// and hands it to the state machine. The millisecond interrupt picks
    /// it up on its next pass.
    fn prepare_transmission(&mut self) {
        let wire_length = self.send.buffer[frame::PAYLOAD_LENGTH_OFFSET] + frame::TRANSMISSION_OVERHEAD as u8;
        self.send.buffer[frame::PAYLOAD_LENGTH_OFFSET] = wire_length;

        let buffered = wire_length as usize - (frame::TRANSMISSION_OVERHEAD - frame::PACKET_OVERHEAD);
        self.send.crc = crc16::block(crc16::SEED, &self.send.buffer[..buffered]);

        self.send.state = SendState::Stx;
        self.send.offset = 0;
        self.send.retries = self.retries;
        self.send.active.store(true, Ordering::Release);
        self.send.packet_queued_in_background.store(true, Ordering::Release);

        logging::trace!(self.log, "packet staged for transmission";
                        "destination" => self.send.buffer[frame::DESTINATION_OFFSET],
                        "wire_length" => wire_length);
    }

    fn transition(&mut self, next: LinkState) {
        logging::trace!(self.log, "link state transition"; "from" => ?self.state, "to" => ?next);
        self.state = next;

        match next {
            LinkState::Idle => {
                if self.send.active.load(Ordering::Acquire) {
                    self.transition(LinkState::Send);
                }
            }

            LinkState::Receive => {
                self.receive.reset();
                self.timer.start(self.ticks, INTERBYTE_TIMEOUT_MSEC);
            }

            LinkState::IdleCooldown => {
                self.timer.start(self.ticks, idle_timeout(self.address));
            }

            LinkState::Send => {
                self.send.state = SendState::Stx;
                self.send.offset = 0;
                self.send.escaped = false;
                self.send_next_byte();
            }

            LinkState::WaitForAck => {
                self.timer.start(self.ticks, ACK_TIMEOUT_MSEC);
            }

            LinkState::CollisionCooldown => {
                self.timer.start(self.ticks, collision_timeout(self.address, self.ticks as u8));
            }
        }
    }

    fn on_timeout(&mut self) {
        match self.state {
            LinkState::Receive => self.transition(LinkState::IdleCooldown),
            LinkState::IdleCooldown => self.transition(LinkState::Idle),
            LinkState::CollisionCooldown => self.transition(LinkState::Idle),

            LinkState::Send => {
                logging::debug!(self.log, "reflection timed out"; "expected" => self.send.expected_reflection);
                self.diagnostics.push(Diagnostic::ReflectionTimedOut);
                self.handle_send_failure();
            }

            LinkState::WaitForAck => self.handle_send_failure(),

            LinkState::Idle => {}
        }
    }

    fn send_next_byte(&mut self) {
        self.timer.start(self.ticks, REFLECTION_TIMEOUT_MSEC);

        let byte = match self.send.state {
            SendState::Stx => {
                self.send.state = SendState::Data;
                frame::STX
            }

            SendState::Data => {
                let pending = self.send.buffer[self.send.offset];
                let (byte, advanced) = frame::consider_escape(&mut self.send.escaped, pending);

                if advanced {
                    self.send.offset += 1;

                    let wire_length = self.send.buffer[frame::PAYLOAD_LENGTH_OFFSET] as usize;
                    if self.send.offset >= wire_length - (frame::TRANSMISSION_OVERHEAD - frame::PACKET_OVERHEAD) {
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
                self.send.state = SendState::Done;
                frame::ETX
            }

            SendState::Done => unreachable!("No bytes remain after ETX"),
        };

        self.send.expected_reflection = byte;
        self.uart.send(byte);
    }

    fn finish_reflected_packet(&mut self) {
        let destination = self.send.buffer[frame::DESTINATION_OFFSET];

        if BROADCAST.matches(destination) {
            self.send.active.store(false, Ordering::Release);
            self.diagnostics.push(Diagnostic::PacketSent);
            self.transition(LinkState::IdleCooldown);
        } else {
            self.transition(LinkState::WaitForAck);
        }
    }

    fn handle_send_failure(&mut self) {
        if self.send.retries > 0 {
            self.send.retries -= 1;
        } else {
            logging::debug!(self.log, "packet discarded, retries exhausted";
                            "destination" => self.send.buffer[frame::DESTINATION_OFFSET]);
            self.send.active.store(false, Ordering::Release);
        }

        self.transition(LinkState::CollisionCooldown);
    }
}

impl<U: Uart> Interface for Gea2<U> {
    fn send<F: FnOnce(&mut PacketMut)>(&mut self, destination: u8, payload_length: usize, fill: F) -> bool {
        Gea2::send(self, destination, payload_length, fill)
    }

    fn forward<F: FnOnce(&mut PacketMut)>(&mut self, destination: u8, payload_length: usize, fill: F) -> bool {
        Gea2::forward(self, destination, payload_length, fill)
    }

    fn run<F: FnMut(Packet<'_>)>(&mut self, on_receive: F) {
        Gea2::run(self, on_receive)
    }

    fn address(&self) -> u8 {
        Gea2::address(self)
    }
}
