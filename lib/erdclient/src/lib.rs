//! Request/response ERD client layered over a GEA link interface.
//!
//! ERDs are 16-bit keyed typed values hosted by peer nodes; this crate
//! issues read and write requests for them, de-duplicates queued
//! requests, retries on timeout and reports one terminal activity event
//! per distinct request. It is generic over
//! [`gealink::interface::Interface`], so it serves single-wire and
//! full-duplex links alike.

pub mod api;
pub mod client;
pub mod config;

pub use crate::api::Erd;
pub use crate::client::{Activity, ErdClient, ErdData, FailureReason, RequestId};
pub use crate::config::ClientConfig;
