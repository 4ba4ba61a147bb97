//! Link layer for the GEA appliance serial bus.
//!
//! Two framers share the wire rules in [`frame`]: [`gea2::Gea2`] drives a
//! half-duplex single-wire bus (reflection checking, collision back-off,
//! ACK handshake) and [`gea3::Gea3`] drives a full-duplex bus paced by the
//! UART send-complete interrupt. Both expose the [`interface::Interface`]
//! contract that request/response clients build on.

#![allow(clippy::new_without_default)]

pub mod config;
pub mod crc16;
pub mod frame;
pub mod gea2;
pub mod gea3;
pub mod interface;
pub mod logging;
pub mod queue;
pub mod receive;
pub mod timer;
pub mod uart;
