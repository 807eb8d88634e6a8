//! Implementation of Password Authenticated Connection Establishment.
//!
//! A handshake runs in the following steps, each one a command exchanged with the card:
//!
//! 1. MANAGE SECURITY ENVIRONMENT: Set AT, selecting protocol, password and domain parameters
//! 2. GENERAL AUTHENTICATE, obtaining the encrypted nonce
//! 3. GENERAL AUTHENTICATE, exchanging public keys for mapping the nonce onto a new generator
//! 4. GENERAL AUTHENTICATE, exchanging ephemeral public keys for key agreement
//! 5. GENERAL AUTHENTICATE, exchanging authentication tokens
//!
//! Afterwards, the derived session keys protect further communication using
//! [`SecureMessaging`](crate::secure_messaging::SecureMessaging).


pub mod commands;
pub mod domain;
pub mod error;
pub mod handshake;
pub mod info;
pub mod kdf;
pub mod oids;
pub mod suite;
pub mod token;


pub use crate::pace::error::{Operation, PaceError};
pub use crate::pace::handshake::{
    establish, EstablishedChannel, HandshakeSession, HandshakeState, PaceInput, SessionKeys,
};
pub use crate::pace::info::{CardAccessFile, PaceSelection, SecurityInfoSource, SecurityInfos};
pub use crate::pace::kdf::{Password, PasswordType};
pub use crate::pace::suite::{FixedScalars, RandomScalars, ScalarSource};
