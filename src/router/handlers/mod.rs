//! HTTP request handlers — the handful of REST routes the engine answers
//! directly; everything session-shaped goes over the duplex channel in
//! [`crate::realtime`] instead.

pub mod system;
