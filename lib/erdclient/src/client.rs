//! The request engine: queues read and write requests, de-duplicates
//! them, emits one at a time over the link, matches responses against the
//! head of the queue and retries on timeout.
//!
//! Queued requests are byte-serialized records, so duplicate detection is
//! a plain bytewise comparison. The scan runs from the tail toward the
//! head and stops at the first conflicting entry: a queued write blocks
//! de-duplication of reads and writes alike, and a queued read blocks
//! de-duplication of writes. Duplicates separated only by compatible
//! requests collapse onto the earlier entry and report its request id.

use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use std::ops::Deref;

use gealink::frame;
use gealink::interface::Interface;
use gealink::logging;
use gealink::queue::RecordQueue;
use gealink::timer::{Ticks, Timer};

use crate::api::{self, Erd};
use crate::config::ClientConfig;

/// 8-bit monotonic handle correlating a read/write with its completion.
pub type RequestId = u8;

/// Largest data block a write request can carry and still fit a frame.
pub const MAX_DATA_SIZE: usize = frame::MAX_PAYLOAD_LENGTH - api::WRITE_REQUEST_HEADER_SIZE;

const TAG_READ: u8 = 0;
const TAG_WRITE: u8 = 1;

// Serialized request record: tag, peer address, big-endian ERD and, for
// writes, the data size and data bytes.
const TAG_OFFSET: usize = 0;
const ADDRESS_OFFSET: usize = 1;
const ERD_OFFSET: usize = 2;
const DATA_SIZE_OFFSET: usize = 4;
const DATA_OFFSET: usize = 5;

const READ_RECORD_SIZE: usize = 4;
const MAX_RECORD_SIZE: usize = DATA_OFFSET + MAX_DATA_SIZE;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FailureReason {
    RetriesExhausted,
}

/// ERD data captured in an activity event. Fixed-size storage so events
/// stay `Copy`-cheap and allocation-free.
#[derive(Copy, Clone)]
pub struct ErdData {
    bytes: [u8; MAX_DATA_SIZE],
    size: u8,
}

impl ErdData {
    pub fn from_slice(data: &[u8]) -> ErdData {
        let mut bytes = [0u8; MAX_DATA_SIZE];
        bytes[..data.len()].copy_from_slice(data);

        ErdData {
            bytes,
            size: data.len() as u8,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }
}

impl Deref for ErdData {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for ErdData {
    fn eq(&self, other: &ErdData) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ErdData {}

impl fmt::Debug for ErdData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_slice().fmt(f)
    }
}

/// Terminal outcome of a request, drained by the application. Data is in
/// wire (big-endian) order; the client never swaps it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Activity {
    ReadCompleted {
        address: u8,
        request_id: RequestId,
        erd: Erd,
        data: ErdData,
    },
    ReadFailed {
        address: u8,
        request_id: RequestId,
        erd: Erd,
        reason: FailureReason,
    },
    WriteCompleted {
        address: u8,
        request_id: RequestId,
        erd: Erd,
        data: ErdData,
    },
    WriteFailed {
        address: u8,
        request_id: RequestId,
        erd: Erd,
        data: ErdData,
        reason: FailureReason,
    },
}

pub struct ErdClient {
    queue: RecordQueue,
    busy: bool,
    remaining_retries: u8,
    request_retries: u8,
    request_timeout: Ticks,
    request_id: RequestId,
    timer: Timer,
    now: Ticks,
    activity: Vec<Activity>,
    log: logging::Logger,
}

#[inline]
fn read_conflicts(queued_tag: u8) -> bool {
    queued_tag == TAG_WRITE
}

#[inline]
fn write_conflicts(_queued_tag: u8) -> bool {
    true
}

impl ErdClient {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(config: &ClientConfig, log: L) -> ErdClient {
        ErdClient {
            queue: RecordQueue::new(config.queue_size),
            busy: false,
            remaining_retries: config.request_retries,
            request_retries: config.request_retries,
            request_timeout: config.request_timeout,
            request_id: 0,
            timer: Timer::new(),
            now: 0,
            activity: Vec::with_capacity(8),
            log: logging::child(log, "erd-client"),
        }
    }

    /// Requests the value of `erd` from `address`. Returns the request id
    /// the eventual activity event will carry, or `None` when the queue
    /// is full. A duplicate of an already-queued read reports the queued
    /// request's id instead of enqueueing again.
    pub fn read<I: Interface>(&mut self, bus: &mut I, address: u8, erd: Erd) -> Option<RequestId> {
        let mut record = [0u8; READ_RECORD_SIZE];
        record[TAG_OFFSET] = TAG_READ;
        record[ADDRESS_OFFSET] = address;
        BigEndian::write_u16(&mut record[ERD_OFFSET..ERD_OFFSET + 2], erd);

        let index = self.enqueue_if_unique(&record, read_conflicts)?;
        let request_id = self.request_id.wrapping_add(index as u8);

        logging::trace!(self.log, "read queued";
                        "address" => address,
                        "erd" => erd,
                        "request_id" => request_id);

        self.pump(bus);

        Some(request_id)
    }

    /// Writes `data` to `erd` on `address`. Data must already be in wire
    /// (big-endian) order. Duplicate handling mirrors [`read`](ErdClient::read).
    pub fn write<I: Interface>(&mut self, bus: &mut I, address: u8, erd: Erd, data: &[u8]) -> Option<RequestId> {
        if data.len() > MAX_DATA_SIZE {
            return None;
        }

        let size = DATA_OFFSET + data.len();
        let mut record = [0u8; MAX_RECORD_SIZE];
        record[TAG_OFFSET] = TAG_WRITE;
        record[ADDRESS_OFFSET] = address;
        BigEndian::write_u16(&mut record[ERD_OFFSET..ERD_OFFSET + 2], erd);
        record[DATA_SIZE_OFFSET] = data.len() as u8;
        record[DATA_OFFSET..size].copy_from_slice(data);

        let index = self.enqueue_if_unique(&record[..size], write_conflicts)?;
        let request_id = self.request_id.wrapping_add(index as u8);

        logging::trace!(self.log, "write queued";
                        "address" => address,
                        "erd" => erd,
                        "data_size" => data.len(),
                        "request_id" => request_id);

        self.pump(bus);

        Some(request_id)
    }

    /// Background step: consumes received packets from the link, applies
    /// the request timeout against `now` and emits the next request when
    /// idle.
    pub fn run<I: Interface>(&mut self, bus: &mut I, now: Ticks) {
        self.now = now;

        bus.run(|packet| self.handle_packet(packet));

        if self.busy && self.timer.expire(now) {
            self.resend_or_fail(bus);
        }

        self.pump(bus);
    }

    /// Drains the terminal events accumulated since the last call. The
    /// caller is free to issue new reads and writes for each one.
    #[inline]
    pub fn activity(&mut self) -> impl Iterator<Item = Activity> + '_ {
        self.activity.drain(..)
    }

    fn handle_packet(&mut self, packet: frame::Packet<'_>) {
        let payload = packet.payload();
        if payload.is_empty() {
            return;
        }

        match payload[0] {
            api::READ_RESPONSE => {
                if let Some(response) = api::parse_read_response(payload) {
                    self.complete_read(packet.source(), response);
                }
            }

            api::WRITE_RESPONSE => {
                if let Some(erd) = api::parse_write_response(payload) {
                    self.complete_write(packet.source(), erd);
                }
            }

            _ => {}
        }
    }

    fn complete_read(&mut self, source: u8, response: api::ReadResponse<'_>) {
        // A response with no data bytes never completes a read
        if response.data.is_empty() || !self.head_matches(TAG_READ, source, response.erd) {
            return;
        }

        let event = Activity::ReadCompleted {
            address: source,
            request_id: self.request_id,
            erd: response.erd,
            data: ErdData::from_slice(response.data),
        };

        logging::trace!(self.log, "read completed";
                        "address" => source,
                        "erd" => response.erd,
                        "data_size" => response.data.len());

        self.finish_request();
        self.activity.push(event);
    }

    fn complete_write(&mut self, source: u8, erd: Erd) {
        if !self.head_matches(TAG_WRITE, source, erd) {
            return;
        }

        let mut head = [0u8; MAX_RECORD_SIZE];
        self.queue.peek(&mut head, 0);
        let data_size = head[DATA_SIZE_OFFSET] as usize;

        let event = Activity::WriteCompleted {
            address: source,
            request_id: self.request_id,
            erd,
            data: ErdData::from_slice(&head[DATA_OFFSET..DATA_OFFSET + data_size]),
        };

        logging::trace!(self.log, "write completed"; "address" => source, "erd" => erd);

        self.finish_request();
        self.activity.push(event);
    }

    /// A response is only a candidate when the head request has the same
    /// kind, the responding peer matches (broadcast requests accept any
    /// source) and the ERD matches.
    fn head_matches(&self, tag: u8, source: u8, erd: Erd) -> bool {
        if self.queue.count() == 0 {
            return false;
        }

        let mut head = [0u8; MAX_RECORD_SIZE];
        self.queue.peek(&mut head, 0);

        if head[TAG_OFFSET] != tag {
            return false;
        }

        let request_address = head[ADDRESS_OFFSET];
        let request_erd = BigEndian::read_u16(&head[ERD_OFFSET..ERD_OFFSET + 2]);

        (request_address == source || request_address == frame::BROADCAST_ADDRESS) && request_erd == erd
    }

    fn resend_or_fail<I: Interface>(&mut self, bus: &mut I) {
        if self.remaining_retries > 0 {
            self.remaining_retries -= 1;
            self.send_request(bus);
        } else {
            self.fail_request();
        }
    }

    fn fail_request(&mut self) {
        let mut head = [0u8; MAX_RECORD_SIZE];
        self.queue.peek(&mut head, 0);

        let address = head[ADDRESS_OFFSET];
        let erd = BigEndian::read_u16(&head[ERD_OFFSET..ERD_OFFSET + 2]);

        let event = match head[TAG_OFFSET] {
            TAG_READ => Activity::ReadFailed {
                address,
                request_id: self.request_id,
                erd,
                reason: FailureReason::RetriesExhausted,
            },
            _ => {
                let data_size = head[DATA_SIZE_OFFSET] as usize;
                Activity::WriteFailed {
                    address,
                    request_id: self.request_id,
                    erd,
                    data: ErdData::from_slice(&head[DATA_OFFSET..DATA_OFFSET + data_size]),
                    reason: FailureReason::RetriesExhausted,
                }
            }
        };

        logging::debug!(self.log, "request failed, retries exhausted"; "address" => address, "erd" => erd);

        self.finish_request();
        self.activity.push(event);
    }

    fn finish_request(&mut self) {
        self.queue.discard();
        self.timer.stop();
        self.busy = false;
        self.request_id = self.request_id.wrapping_add(1);
    }

    fn pump<I: Interface>(&mut self, bus: &mut I) {
        if !self.busy && self.queue.count() > 0 {
            self.busy = true;
            self.remaining_retries = self.request_retries;
            self.send_request(bus);
        }
    }

    fn send_request<I: Interface>(&mut self, bus: &mut I) {
        let mut head = [0u8; MAX_RECORD_SIZE];
        self.queue.peek(&mut head, 0);

        let address = head[ADDRESS_OFFSET];
        let erd = BigEndian::read_u16(&head[ERD_OFFSET..ERD_OFFSET + 2]);

        match head[TAG_OFFSET] {
            TAG_READ => {
                bus.send(address, api::READ_REQUEST_SIZE, |packet| {
                    api::write_read_request(packet.payload_mut(), erd);
                });
            }

            _ => {
                let data_size = head[DATA_SIZE_OFFSET] as usize;
                let data = &head[DATA_OFFSET..DATA_OFFSET + data_size];

                bus.send(address, api::WRITE_REQUEST_HEADER_SIZE + data_size, |packet| {
                    api::write_write_request(packet.payload_mut(), erd, data);
                });
            }
        }

        self.timer.start(self.now, self.request_timeout);
    }

    /// Scans the queue from the tail toward the head. An exact bytewise
    /// duplicate reuses the queued entry's offset; a conflicting entry
    /// stops the scan and the request is appended. Returns the queue
    /// offset, or `None` when the queue rejected the record.
    fn enqueue_if_unique(&mut self, record: &[u8], conflicts: fn(u8) -> bool) -> Option<usize> {
        let count = self.queue.count();
        let mut queued = [0u8; MAX_RECORD_SIZE];

        for index in (0..count).rev() {
            let size = self.queue.peek(&mut queued, index);

            if size == record.len() && &queued[..size] == record {
                return Some(index);
            }

            if conflicts(queued[TAG_OFFSET]) {
                break;
            }
        }

        if self.queue.enqueue(record) {
            Some(count)
        } else {
            logging::debug!(self.log, "request rejected, queue full"; "queued" => count);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gealink::frame::{Packet, PacketMut};
    use std::collections::VecDeque;

    const CLIENT_ADDRESS: u8 = 0xA5;
    const REQUEST_TIMEOUT: Ticks = 500;
    const REQUEST_RETRIES: u8 = 3;

    struct FakeBus {
        address: u8,
        sent: Vec<(u8, Vec<u8>)>,
        inbound: VecDeque<(u8, Vec<u8>)>,
    }

    impl FakeBus {
        fn new() -> FakeBus {
            FakeBus {
                address: CLIENT_ADDRESS,
                sent: Vec::new(),
                inbound: VecDeque::new(),
            }
        }
    }

    impl Interface for FakeBus {
        fn send<F: FnOnce(&mut PacketMut)>(&mut self, destination: u8, payload_length: usize, fill: F) -> bool {
            let mut bytes = vec![0u8; frame::PACKET_OVERHEAD + payload_length];
            bytes[frame::PAYLOAD_LENGTH_OFFSET] = payload_length as u8;

            let mut packet = PacketMut::new(&mut bytes);
            fill(&mut packet);
            packet.set_source(self.address);
            packet.set_destination(destination);

            self.sent.push((destination, bytes[frame::PAYLOAD_OFFSET..].to_vec()));
            true
        }

        fn forward<F: FnOnce(&mut PacketMut)>(&mut self, destination: u8, payload_length: usize, fill: F) -> bool {
            let mut bytes = vec![0u8; frame::PACKET_OVERHEAD + payload_length];
            bytes[frame::PAYLOAD_LENGTH_OFFSET] = payload_length as u8;

            let mut packet = PacketMut::new(&mut bytes);
            fill(&mut packet);
            packet.set_destination(destination);

            self.sent.push((destination, bytes[frame::PAYLOAD_OFFSET..].to_vec()));
            true
        }

        fn run<F: FnMut(Packet<'_>)>(&mut self, mut on_receive: F) {
            if let Some((source, payload)) = self.inbound.pop_front() {
                let mut bytes = vec![0u8; frame::PACKET_OVERHEAD + payload.len()];
                bytes[frame::DESTINATION_OFFSET] = self.address;
                bytes[frame::PAYLOAD_LENGTH_OFFSET] = payload.len() as u8;
                bytes[frame::SOURCE_OFFSET] = source;
                bytes[frame::PAYLOAD_OFFSET..].copy_from_slice(&payload);

                on_receive(Packet::new(&bytes));
            }
        }

        fn address(&self) -> u8 {
            self.address
        }
    }

    struct Harness {
        client: ErdClient,
        bus: FakeBus,
        now: Ticks,
    }

    impl Harness {
        fn new() -> Harness {
            Harness::with_queue_size(256)
        }

        fn with_queue_size(queue_size: usize) -> Harness {
            let config = ClientConfig {
                request_timeout: REQUEST_TIMEOUT,
                request_retries: REQUEST_RETRIES,
                queue_size,
            };

            Harness {
                client: ErdClient::new(&config, None),
                bus: FakeBus::new(),
                now: 0,
            }
        }

        fn read(&mut self, address: u8, erd: Erd) -> Option<RequestId> {
            self.client.read(&mut self.bus, address, erd)
        }

        fn write(&mut self, address: u8, erd: Erd, data: &[u8]) -> Option<RequestId> {
            self.client.write(&mut self.bus, address, erd, data)
        }

        fn run(&mut self) {
            self.client.run(&mut self.bus, self.now);
        }

        fn after(&mut self, ticks: Ticks) {
            self.now += ticks;
            self.run();
        }

        fn receive(&mut self, source: u8, payload: Vec<u8>) {
            self.bus.inbound.push_back((source, payload));
            self.run();
        }

        fn receive_read_response(&mut self, source: u8, erd: Erd, data: &[u8]) {
            let mut payload = vec![api::READ_RESPONSE, 1, (erd >> 8) as u8, erd as u8, data.len() as u8];
            payload.extend_from_slice(data);
            self.receive(source, payload);
        }

        fn receive_write_response(&mut self, source: u8, erd: Erd) {
            self.receive(source, vec![api::WRITE_RESPONSE, 1, (erd >> 8) as u8, erd as u8]);
        }

        fn sent(&mut self) -> Vec<(u8, Vec<u8>)> {
            self.bus.sent.drain(..).collect()
        }

        fn activity(&mut self) -> Vec<Activity> {
            self.client.activity().collect()
        }
    }

    fn read_request(erd: Erd) -> Vec<u8> {
        vec![api::READ_REQUEST, 1, (erd >> 8) as u8, erd as u8]
    }

    fn write_request(erd: Erd, data: &[u8]) -> Vec<u8> {
        let mut payload = vec![api::WRITE_REQUEST, 1, (erd >> 8) as u8, erd as u8, data.len() as u8];
        payload.extend_from_slice(data);
        payload
    }

    #[test]
    fn test_completes_a_read() {
        let mut h = Harness::new();

        assert_eq!(h.read(0x54, 0x1234), Some(0));
        assert_eq!(h.sent(), vec![(0x54, read_request(0x1234))]);

        h.receive_read_response(0x54, 0x1234, &[123]);

        assert_eq!(
            h.activity(),
            vec![Activity::ReadCompleted {
                address: 0x54,
                request_id: 0,
                erd: 0x1234,
                data: ErdData::from_slice(&[123]),
            }]
        );
    }

    #[test]
    fn test_broadcast_read_accepts_any_responder() {
        let mut h = Harness::new();

        h.read(0xFF, 0x1234);
        h.receive_read_response(0x54, 0x1234, &[123]);

        assert_eq!(
            h.activity(),
            vec![Activity::ReadCompleted {
                address: 0x54,
                request_id: 0,
                erd: 0x1234,
                data: ErdData::from_slice(&[123]),
            }]
        );
    }

    #[test]
    fn test_mismatched_responses_leave_the_read_pending() {
        let mut h = Harness::new();

        h.read(0x54, 0x1234);
        h.sent();

        // Wrong kind, wrong source, wrong ERD, wrong count, no data
        h.receive_write_response(0x54, 0x1234);
        h.receive_read_response(0x55, 0x1234, &[123]);
        h.receive_read_response(0x54, 0x1235, &[123]);
        h.receive(0x54, vec![api::READ_RESPONSE, 0, 0x12, 0x34, 1, 123]);
        h.receive(0x54, vec![api::READ_RESPONSE, 1, 0x12, 0x34, 0]);
        assert_eq!(h.activity(), vec![]);

        // The request is still pending and completes normally
        h.receive_read_response(0x54, 0x1234, &[123]);
        assert_eq!(h.activity().len(), 1);
    }

    #[test]
    fn test_completes_a_write() {
        let mut h = Harness::new();

        assert_eq!(h.write(0x54, 0x1234, &[123]), Some(0));
        assert_eq!(h.sent(), vec![(0x54, write_request(0x1234, &[123]))]);

        h.receive_write_response(0x54, 0x1234);

        assert_eq!(
            h.activity(),
            vec![Activity::WriteCompleted {
                address: 0x54,
                request_id: 0,
                erd: 0x1234,
                data: ErdData::from_slice(&[123]),
            }]
        );
    }

    #[test]
    fn test_broadcast_write_accepts_any_responder() {
        let mut h = Harness::new();

        h.write(0xFF, 0x1234, &[123]);
        h.receive_write_response(0x54, 0x1234);

        assert_eq!(
            h.activity(),
            vec![Activity::WriteCompleted {
                address: 0x54,
                request_id: 0,
                erd: 0x1234,
                data: ErdData::from_slice(&[123]),
            }]
        );
    }

    #[test]
    fn test_mismatched_responses_leave_the_write_pending() {
        let mut h = Harness::new();

        h.write(0x54, 0x1234, &[123]);
        h.sent();

        h.receive_read_response(0x54, 0x1234, &[123]);
        h.receive_write_response(0x55, 0x1234);
        h.receive_write_response(0x54, 0x1235);
        h.receive(0x54, vec![api::WRITE_RESPONSE, 0, 0x12, 0x34]);
        h.receive(0x54, vec![api::WRITE_RESPONSE, 1, 0x12, 0x34, 0x00]);
        assert_eq!(h.activity(), vec![]);

        h.receive_write_response(0x54, 0x1234);
        assert_eq!(h.activity().len(), 1);
    }

    #[test]
    fn test_requests_are_serviced_in_order() {
        let mut h = Harness::new();

        h.read(0x54, 0x1234);
        h.write(0x56, 0x5678, &[21]);
        h.read(0x54, 0x4321);
        assert_eq!(h.sent(), vec![(0x54, read_request(0x1234))]);

        h.receive_read_response(0x54, 0x1234, &[123]);
        assert_eq!(h.sent(), vec![(0x56, write_request(0x5678, &[21]))]);

        h.receive_write_response(0x56, 0x5678);
        assert_eq!(h.sent(), vec![(0x54, read_request(0x4321))]);

        h.receive_read_response(0x54, 0x4321, &[7]);
        assert_eq!(h.activity().len(), 3);
    }

    #[test]
    fn test_requests_fail_to_queue_when_full() {
        // Room for three requests: 6 + 8 + 6 ring bytes of 25
        let mut h = Harness::with_queue_size(25);

        assert!(h.read(0x54, 0x1234).is_some());
        assert!(h.write(0x56, 0x5678, &[21]).is_some());
        assert!(h.read(0x54, 0x4321).is_some());

        assert_eq!(h.read(0x75, 0x1234), None);
        assert_eq!(h.write(0x75, 0x5678, &[21]), None);
    }

    #[test]
    fn test_read_retries_then_fails() {
        let mut h = Harness::new();

        h.read(0x54, 0x1234);
        assert_eq!(h.sent().len(), 1);

        for _ in 0..REQUEST_RETRIES {
            h.after(REQUEST_TIMEOUT - 1);
            assert_eq!(h.sent(), vec![]);

            h.after(1);
            assert_eq!(h.sent(), vec![(0x54, read_request(0x1234))]);
        }

        h.after(REQUEST_TIMEOUT - 1);
        assert_eq!(h.activity(), vec![]);

        h.after(1);
        assert_eq!(
            h.activity(),
            vec![Activity::ReadFailed {
                address: 0x54,
                request_id: 0,
                erd: 0x1234,
                reason: FailureReason::RetriesExhausted,
            }]
        );

        // Nothing further happens once the request is gone
        h.after(REQUEST_TIMEOUT * 5);
        assert_eq!(h.sent(), vec![]);
    }

    #[test]
    fn test_write_retries_then_fails() {
        let mut h = Harness::new();

        h.write(0x54, 0x1234, &[0x7B]);
        assert_eq!(h.sent().len(), 1);

        for _ in 0..REQUEST_RETRIES {
            h.after(REQUEST_TIMEOUT);
            assert_eq!(h.sent(), vec![(0x54, write_request(0x1234, &[0x7B]))]);
        }

        h.after(REQUEST_TIMEOUT);
        assert_eq!(
            h.activity(),
            vec![Activity::WriteFailed {
                address: 0x54,
                request_id: 0,
                erd: 0x1234,
                data: ErdData::from_slice(&[0x7B]),
                reason: FailureReason::RetriesExhausted,
            }]
        );
    }

    #[test]
    fn test_successful_requests_are_not_retried() {
        let mut h = Harness::new();

        h.read(0x54, 0x1234);
        h.receive_read_response(0x54, 0x1234, &[123]);
        h.sent();

        h.after(REQUEST_TIMEOUT * 5);
        assert_eq!(h.sent(), vec![]);
    }

    #[test]
    fn test_continues_to_the_next_request_after_a_failure() {
        let mut h = Harness::new();

        h.read(0x54, 0x1234);
        h.write(0x56, 0x5678, &[21]);
        h.sent();

        for _ in 0..REQUEST_RETRIES {
            h.after(REQUEST_TIMEOUT);
        }
        h.sent();

        // The failing read is popped and the write goes out immediately
        h.after(REQUEST_TIMEOUT);
        assert_eq!(h.sent(), vec![(0x56, write_request(0x5678, &[21]))]);
        assert_eq!(h.activity().len(), 1);
    }

    #[test]
    fn test_responses_without_active_requests_are_ignored() {
        let mut h = Harness::new();

        h.receive_read_response(0x54, 0x1234, &[123]);
        h.receive_write_response(0x54, 0x1234);

        assert_eq!(h.activity(), vec![]);
    }

    #[test]
    fn test_duplicate_reads_back_to_back_share_an_id() {
        let mut h = Harness::new();

        assert_eq!(h.read(0x54, 0x1234), Some(0));
        assert_eq!(h.read(0x54, 0x1234), Some(0));

        h.receive_read_response(0x54, 0x1234, &[123]);
        assert_eq!(h.activity().len(), 1);

        // One transmission, one completion
        h.after(REQUEST_TIMEOUT * 5);
        assert_eq!(h.sent().len(), 1);
    }

    #[test]
    fn test_duplicate_reads_separated_by_another_read_share_an_id() {
        let mut h = Harness::new();

        assert_eq!(h.read(0x54, 0x1234), Some(0));
        assert_eq!(h.read(0x54, 0x5678), Some(1));
        assert_eq!(h.read(0x54, 0x1234), Some(0));
    }

    #[test]
    fn test_duplicate_reads_separated_by_a_write_stay_distinct() {
        let mut h = Harness::new();

        assert_eq!(h.read(0x54, 0x1234), Some(0));
        assert_eq!(h.write(0x54, 0x5678, &[21]), Some(1));
        assert_eq!(h.read(0x54, 0x1234), Some(2));
    }

    #[test]
    fn test_duplicate_writes_back_to_back_share_an_id() {
        let mut h = Harness::new();

        assert_eq!(h.write(0x56, 0xABCD, &[42]), Some(0));
        assert_eq!(h.write(0x56, 0xABCD, &[42]), Some(0));
        assert_eq!(h.write(0x56, 0x5678, &[21]), Some(1));
        assert_eq!(h.write(0x56, 0x5678, &[21]), Some(1));
    }

    #[test]
    fn test_writes_with_different_values_stay_distinct() {
        let mut h = Harness::new();

        assert_eq!(h.write(0x56, 0xABCD, &[1]), Some(0));
        assert_eq!(h.write(0x56, 0xABCD, &[2]), Some(1));
    }

    #[test]
    fn test_duplicate_writes_separated_by_a_read_stay_distinct() {
        let mut h = Harness::new();

        assert_eq!(h.write(0x56, 0xABCD, &[42]), Some(0));
        assert_eq!(h.read(0x56, 0x5678), Some(1));
        assert_eq!(h.write(0x56, 0xABCD, &[42]), Some(2));
    }

    #[test]
    fn test_request_ids_advance_with_completions() {
        let mut h = Harness::new();

        assert_eq!(h.read(0x54, 0x1234), Some(0));
        assert_eq!(h.read(0x56, 0x5678), Some(1));

        h.receive_read_response(0x54, 0x1234, &[123]);

        // The base has advanced past the completed request
        assert_eq!(h.read(0x56, 0xABCD), Some(2));
        assert_eq!(h.read(0x56, 0x5678), Some(1));

        h.receive_read_response(0x56, 0x5678, &[21]);

        let completed: Vec<RequestId> = h
            .activity()
            .iter()
            .map(|event| match event {
                Activity::ReadCompleted { request_id, .. } => *request_id,
                _ => panic!("Unexpected activity"),
            })
            .collect();
        assert_eq!(completed, vec![0, 1]);
    }

    #[test]
    fn test_failed_requests_report_the_id_handed_out_at_enqueue() {
        let mut h = Harness::new();

        assert_eq!(h.read(0x56, 0xABCD), Some(0));

        for _ in 0..=REQUEST_RETRIES {
            h.after(REQUEST_TIMEOUT);
        }

        assert_eq!(
            h.activity(),
            vec![Activity::ReadFailed {
                address: 0x56,
                request_id: 0,
                erd: 0xABCD,
                reason: FailureReason::RetriesExhausted,
            }]
        );
    }

    #[test]
    fn test_new_requests_can_be_issued_after_draining_activity() {
        let mut h = Harness::new();

        h.read(0x54, 0x1234);
        h.receive_read_response(0x54, 0x1234, &[123]);
        h.sent();

        for event in h.client.activity().collect::<Vec<_>>() {
            if let Activity::ReadCompleted { erd, .. } = event {
                assert_eq!(h.read(0x54, erd), Some(1));
            }
        }

        assert_eq!(h.sent(), vec![(0x54, read_request(0x1234))]);
    }

    #[test]
    fn test_oversized_write_data_is_rejected() {
        let mut h = Harness::new();

        let data = [0u8; MAX_DATA_SIZE + 1];
        assert_eq!(h.write(0x54, 0x1234, &data), None);
        assert_eq!(h.sent(), vec![]);
    }
}
