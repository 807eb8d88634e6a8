//! Password Authenticated Connection Establishment (PACE) for contactless identity documents
//! following ICAO Doc 9303 Part 11 and BSI TR-03110.
//!
//! The card itself is reached through a [`Dispatcher`](iso7816::card::Dispatcher) provided by
//! the caller.


pub mod config;
pub mod crypt;
pub mod iso7816;
pub mod pace;
pub mod secure_messaging;
pub mod tlv;
