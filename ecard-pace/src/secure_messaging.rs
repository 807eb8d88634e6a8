//! Secure Messaging with the keys agreed upon by PACE.
//!
//! Only the AES variants are supported: AES-CBC for confidentiality with the IV derived from the
//! send sequence counter, AES-CMAC truncated to eight bytes for integrity.


use std::fmt;

use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::crypt::{self, pad_iso9797_m2, unpad_iso9797_m2};
use crate::crypt::cipher_mac::CipherAndMac;
use crate::iso7816::apdu::{self, CommandApdu, Response, StatusWord};
use crate::iso7816::card::{Dispatcher, SlotHandle, TransportError};
use crate::tlv::{encode, Tag, Tlv};


/// Padding indicator of DO87: ISO/IEC 7816-4 padding (`0x80` then zeroes).
const PADDING_ISO7816: u8 = 0x01;

/// Class byte bits marking a command as protected, with the header included in the MAC.
const CLA_SECURE_MESSAGING: u8 = 0b0000_1100;

const TAG_ENCRYPTED_DATA: Tag = Tag::context(0x07);
const TAG_EXPECTED_LENGTH: Tag = Tag::context(0x17);
const TAG_STATUS: Tag = Tag::context(0x19);
const TAG_MAC: Tag = Tag::context(0x0E);


#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the secure messaging channel has been invalidated")]
    Invalidated,

    #[error("response MAC incorrect")]
    ResponseMac,

    #[error("response does not contain a MAC")]
    MissingResponseMac,

    #[error("response does not contain status")]
    MissingResponseStatus,

    #[error("response payload has unknown padding mode {padding_mode}")]
    UnknownPadding { padding_mode: u8 },

    #[error("response payload has invalid padding")]
    InvalidPadding,

    #[error("response has an invalid TLV format")]
    ResponseTlvFormat,

    #[error("card answered without secure messaging, status {status}")]
    Unprotected { status: StatusWord },

    #[error("APDU error: {0}")]
    Apdu(#[from] apdu::Error),

    #[error("cryptographic failure: {0}")]
    Crypto(#[from] crypt::Error),
}


/// The state of a Secure Messaging session.
///
/// Any failure invalidates the session for good; the card discards its session keys in that case
/// too.
pub struct SecureMessaging {
    cipher: CipherAndMac,
    k_enc: Zeroizing<Vec<u8>>,
    k_mac: Zeroizing<Vec<u8>>,
    send_sequence_counter: Zeroizing<Vec<u8>>,
    invalidated: bool,
}
impl SecureMessaging {
    /// Starts a session with the send sequence counter at zero.
    pub fn new(cipher: CipherAndMac, k_enc: &[u8], k_mac: &[u8]) -> Result<Self, Error> {
        for key in [k_enc, k_mac] {
            if key.len() != cipher.cipher_key_size() {
                return Err(crypt::Error::KeyLength { expected: cipher.cipher_key_size(), obtained: key.len() }.into());
            }
        }
        Ok(Self {
            cipher,
            k_enc: Zeroizing::new(k_enc.to_vec()),
            k_mac: Zeroizing::new(k_mac.to_vec()),
            send_sequence_counter: Zeroizing::new(vec![0u8; cipher.cipher_block_size()]),
            invalidated: false,
        })
    }

    pub fn cipher(&self) -> CipherAndMac { self.cipher }
    pub fn is_invalidated(&self) -> bool { self.invalidated }
    pub fn send_sequence_counter(&self) -> &[u8] { &self.send_sequence_counter }

    /// Increment the send sequence counter (big endian, wrapping).
    fn increment_send_sequence_counter(&mut self) {
        for b in self.send_sequence_counter.iter_mut().rev() {
            if *b == 0xFF {
                *b = 0x00;
                // carry; keep going
            } else {
                *b += 1;
                break;
            }
        }
    }

    /// The IV for the current send sequence counter: `AES(K_enc, SSC)`.
    fn derive_iv(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        Ok(self.cipher.encrypt_block(&self.send_sequence_counter, &self.k_enc)?)
    }

    fn guard<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(error) = &result {
            debug!(%error, "secure messaging channel invalidated");
            self.invalidated = true;
        }
        result
    }

    /// Wraps a plain command APDU.
    pub fn protect(&mut self, command: &CommandApdu) -> Result<CommandApdu, Error> {
        if self.invalidated {
            return Err(Error::Invalidated);
        }
        let result = self.protect_inner(command);
        self.guard(result)
    }

    fn protect_inner(&mut self, command: &CommandApdu) -> Result<CommandApdu, Error> {
        let block_size = self.cipher.cipher_block_size();
        self.increment_send_sequence_counter();

        // add secure messaging mark to CLA (header is part of MAC)
        let mut header = *command.header();
        header.cla |= CLA_SECURE_MESSAGING;
        let mut padded_header = header.to_bytes().to_vec();
        pad_iso9797_m2(&mut padded_header, block_size);

        let mut body = Vec::new();
        if let Some(data) = command.data() {
            let mut padded_data = Zeroizing::new(data.to_vec());
            pad_iso9797_m2(&mut padded_data, block_size);
            let iv = self.derive_iv()?;
            self.cipher.encrypt_padded_data(&mut padded_data, &self.k_enc, &iv)?;

            let mut value = Vec::with_capacity(1 + padded_data.len());
            value.push(PADDING_ISO7816);
            value.extend(padded_data.iter());
            body.extend(encode(TAG_ENCRYPTED_DATA, &value));
        }

        if let Some(le) = command.expected_length() {
            let le_bytes = if command.is_extended() {
                ((le % 65536) as u16).to_be_bytes().to_vec()
            } else {
                vec![(le % 256) as u8]
            };
            body.extend(encode(TAG_EXPECTED_LENGTH, &le_bytes));
        }

        let mut mac_input = Zeroizing::new(self.send_sequence_counter.to_vec());
        mac_input.extend(&padded_header);
        mac_input.extend(&body);
        pad_iso9797_m2(&mut mac_input, block_size);
        let mac = self.cipher.mac(&mac_input, &self.k_mac)?;
        body.extend(encode(TAG_MAC, &mac));

        // protected responses always carry at least DO99 and DO8E
        let protected_le = if command.is_extended() || body.len() > 255 { 65536 } else { 256 };
        Ok(CommandApdu::with_body(header, Some(body), Some(protected_le))?)
    }

    /// Unwraps a protected response APDU, verifying its MAC.
    pub fn unprotect(&mut self, response: &Response) -> Result<Response, Error> {
        if self.invalidated {
            return Err(Error::Invalidated);
        }
        let result = self.unprotect_inner(response);
        self.guard(result)
    }

    fn unprotect_inner(&mut self, response: &Response) -> Result<Response, Error> {
        let block_size = self.cipher.cipher_block_size();
        self.increment_send_sequence_counter();

        if response.data.is_empty() {
            // e.g. 0x6987 (expected SM data objects missing) or 0x6988 (SM data objects incorrect)
            return Err(Error::Unprotected { status: response.trailer });
        }

        let mut mac_input = Zeroizing::new(self.send_sequence_counter.to_vec());
        let mut encrypted_data = None;
        let mut status = None;
        let mut received_mac = None;

        let mut remaining = response.data.as_slice();
        while !remaining.is_empty() {
            let (node, rest) = Tlv::parse_one(remaining)
                .map_err(|_| Error::ResponseTlvFormat)?;
            let raw = &remaining[..remaining.len() - rest.len()];
            remaining = rest;

            let value = node.primitive_value()
                .ok_or(Error::ResponseTlvFormat)?;
            match node.tag() {
                TAG_MAC => received_mac = Some(value.to_vec()),
                TAG_ENCRYPTED_DATA => {
                    mac_input.extend(raw);
                    encrypted_data = Some(value.to_vec());
                },
                TAG_STATUS => {
                    mac_input.extend(raw);
                    status = Some(value.to_vec());
                },
                other => {
                    // odd tag numbers are covered by the MAC
                    if other.number & 0b1 != 0 {
                        mac_input.extend(raw);
                    }
                },
            }
        }

        let received_mac = received_mac.ok_or(Error::MissingResponseMac)?;
        pad_iso9797_m2(&mut mac_input, block_size);
        if !self.cipher.verify_mac(&mac_input, &self.k_mac, &received_mac)? {
            return Err(Error::ResponseMac);
        }

        let status = status.ok_or(Error::MissingResponseStatus)?;
        let &[sw1, sw2] = status.as_slice() else {
            return Err(Error::ResponseTlvFormat);
        };

        let data = match encrypted_data {
            None => Vec::new(),
            Some(encrypted) => {
                let Some((&padding_mode, ciphertext)) = encrypted.split_first() else {
                    return Err(Error::ResponseTlvFormat);
                };
                if padding_mode != PADDING_ISO7816 {
                    return Err(Error::UnknownPadding { padding_mode });
                }
                let iv = self.derive_iv()?;
                let mut plaintext = Zeroizing::new(ciphertext.to_vec());
                self.cipher.decrypt_padded_data(&mut plaintext, &self.k_enc, &iv)?;
                unpad_iso9797_m2(&plaintext)
                    .ok_or(Error::InvalidPadding)?
                    .to_vec()
            },
        };

        Ok(Response::new(data, StatusWord::new(sw1, sw2)))
    }
}
impl fmt::Debug for SecureMessaging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureMessaging")
            .field("cipher", &self.cipher)
            .field("invalidated", &self.invalidated)
            .finish_non_exhaustive()
    }
}


/// A dispatcher that protects every command and unprotects every response.
pub struct SecureChannel<'d, D: Dispatcher + ?Sized> {
    dispatcher: &'d mut D,
    secure_messaging: SecureMessaging,
}
impl<'d, D: Dispatcher + ?Sized> SecureChannel<'d, D> {
    pub fn new(dispatcher: &'d mut D, secure_messaging: SecureMessaging) -> Self {
        Self { dispatcher, secure_messaging }
    }

    pub fn secure_messaging(&self) -> &SecureMessaging { &self.secure_messaging }

    pub fn into_secure_messaging(self) -> SecureMessaging { self.secure_messaging }
}
impl<'d, D: Dispatcher + ?Sized> Dispatcher for SecureChannel<'d, D> {
    fn transmit(&mut self, slot: &SlotHandle, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        let plain_command = CommandApdu::from_bytes(command)
            .map_err(Error::from)?;
        trace!(?slot, command = %hex::encode_upper(command), "protecting command");
        let protected_command = self.secure_messaging.protect(&plain_command)?;

        let raw_response = self.dispatcher.transmit(slot, &protected_command.to_bytes())?;
        let protected_response = Response::from_bytes(&raw_response)
            .map_err(Error::from)?;
        let plain_response = self.secure_messaging.unprotect(&protected_response)?;

        let response_bytes = plain_response.to_bytes();
        trace!(?slot, response = %hex::encode_upper(&response_bytes), "unprotected response");
        Ok(response_bytes)
    }
}


#[cfg(test)]
mod tests {
    use super::{Error, SecureChannel, SecureMessaging};
    use crate::crypt::{pad_iso9797_m2, unpad_iso9797_m2};
    use crate::crypt::cipher_mac::CipherAndMac;
    use crate::iso7816::apdu::{CommandApdu, CommandHeader, Response, StatusWord};
    use crate::iso7816::card::{Dispatcher, SlotHandle, TransportError};
    use crate::tlv::{encode, Tag, Tlv};
    use hex_literal::hex;

    // session keys of ICAO Doc 9303 Part 11 Appendix G.1
    const K_ENC: [u8; 16] = hex!("F5F0E35C 0D7161EE 6724EE51 3A0D9A7F");
    const K_MAC: [u8; 16] = hex!("FE251C78 58B356B2 4514B3BD 5F4297D1");

    /// The card's half of secure messaging.
    struct SecureCard {
        ssc: [u8; 16],
        received: Vec<CommandApdu>,
        answer: Vec<u8>,
        tamper_mac: bool,
        omit_status: bool,
    }
    impl SecureCard {
        fn new(answer: &[u8]) -> Self {
            Self { ssc: [0u8; 16], received: Vec::new(), answer: answer.to_vec(), tamper_mac: false, omit_status: false }
        }

        fn increment(&mut self) {
            let value = u128::from_be_bytes(self.ssc).wrapping_add(1);
            self.ssc = value.to_be_bytes();
        }

        fn iv(&self) -> Vec<u8> {
            CipherAndMac::Aes128.encrypt_block(&self.ssc, &K_ENC).unwrap().to_vec()
        }

        fn mac(&self, objects: &[u8]) -> [u8; 8] {
            let mut input = self.ssc.to_vec();
            input.extend(objects);
            pad_iso9797_m2(&mut input, 16);
            CipherAndMac::Aes128.mac(&input, &K_MAC).unwrap()
        }

        fn unwrap_command(&mut self, command: &CommandApdu) -> CommandApdu {
            self.increment();
            let body = command.data().unwrap();
            let outer = Tlv::parse(body).unwrap();
            let nodes: Vec<&Tlv> = outer.siblings().collect();
            let (mac_node, covered) = nodes.split_last().unwrap();
            assert_eq!(mac_node.tag(), Tag::context(0x0E));

            let mut header = command.header().to_bytes().to_vec();
            pad_iso9797_m2(&mut header, 16);
            let covered_bytes: Vec<u8> = covered.iter().flat_map(|n| n.to_bytes()).collect();
            header.extend(&covered_bytes);
            assert_eq!(mac_node.primitive_value().unwrap(), &self.mac(&header));

            let mut plain_header = *command.header();
            plain_header.cla &= !0x0C;
            let data = covered.iter()
                .find(|n| n.tag() == Tag::context(0x07))
                .map(|n| {
                    let value = n.primitive_value().unwrap();
                    assert_eq!(value[0], 0x01);
                    let mut plain = value[1..].to_vec();
                    CipherAndMac::Aes128.decrypt_padded_data(&mut plain, &K_ENC, &self.iv()).unwrap();
                    unpad_iso9797_m2(&plain).unwrap().to_vec()
                });
            let le = covered.iter()
                .find(|n| n.tag() == Tag::context(0x17))
                .map(|n| match n.primitive_value().unwrap() {
                    [0x00] => 256,
                    [b] => u32::from(*b),
                    other => u32::from(u16::from_be_bytes([other[0], other[1]])),
                });
            CommandApdu::with_body(plain_header, data, le).unwrap()
        }

        fn wrap_response(&mut self, data: &[u8], status: [u8; 2]) -> Vec<u8> {
            self.increment();
            let mut objects = Vec::new();
            if !data.is_empty() {
                let mut padded = data.to_vec();
                pad_iso9797_m2(&mut padded, 16);
                CipherAndMac::Aes128.encrypt_padded_data(&mut padded, &K_ENC, &self.iv()).unwrap();
                let mut value = vec![0x01];
                value.extend(padded);
                objects.extend(encode(Tag::context(0x07), &value));
            }
            if !self.omit_status {
                objects.extend(encode(Tag::context(0x19), &status));
            }
            let mut mac = self.mac(&objects);
            if self.tamper_mac {
                mac[0] ^= 0x01;
            }
            objects.extend(encode(Tag::context(0x0E), &mac));
            objects.extend(hex!("90 00"));
            objects
        }
    }
    impl Dispatcher for SecureCard {
        fn transmit(&mut self, _slot: &SlotHandle, command: &[u8]) -> Result<Vec<u8>, TransportError> {
            let protected = CommandApdu::from_bytes(command)?;
            assert_eq!(protected.header().cla & 0x0C, 0x0C);
            let plain = self.unwrap_command(&protected);
            self.received.push(plain);
            let answer = self.answer.clone();
            Ok(self.wrap_response(&answer, [0x90, 0x00]))
        }
    }

    fn select_command() -> CommandApdu {
        CommandApdu::with_body(
            CommandHeader::new(0x00, 0xA4, 0x02, 0x0C),
            Some(hex!("01 1E").to_vec()),
            None,
        ).unwrap()
    }

    fn read_command() -> CommandApdu {
        CommandApdu::with_body(CommandHeader::new(0x00, 0xB0, 0x00, 0x00), None, Some(256)).unwrap()
    }

    #[test]
    fn protected_command_layout() {
        let mut sm = SecureMessaging::new(CipherAndMac::Aes128, &K_ENC, &K_MAC).unwrap();
        let protected = sm.protect(&select_command()).unwrap();
        assert_eq!(sm.send_sequence_counter(), &hex!("00000000 00000000 00000000 00000001"));

        let bytes = protected.to_bytes();
        assert_eq!(&bytes[..4], &hex!("0C A4 02 0C"));
        // Lc, DO87 (1 + 16 bytes), DO8E, Le
        assert_eq!(bytes[4], 0x1D);
        assert_eq!(&bytes[5..8], &hex!("87 11 01"));
        assert_eq!(&bytes[24..26], &hex!("8E 08"));
        assert_eq!(bytes.len(), 4 + 1 + 0x1D + 1);
        assert_eq!(bytes[bytes.len() - 1], 0x00);

        let read = sm.protect(&read_command()).unwrap();
        assert_eq!(&read.data().unwrap()[..3], &hex!("97 01 00"));
        assert_eq!(sm.send_sequence_counter(), &hex!("00000000 00000000 00000000 00000002"));
    }

    #[test]
    fn channel_round_trip() {
        let mut card = SecureCard::new(&hex!("31 14 30 12"));
        let sm = SecureMessaging::new(CipherAndMac::Aes128, &K_ENC, &K_MAC).unwrap();
        let mut channel = SecureChannel::new(&mut card, sm);
        let slot = SlotHandle::default();

        let response = channel.transmit(&slot, &select_command().to_bytes()).unwrap();
        assert_eq!(response, hex!("31 14 30 12 90 00"));
        let response = channel.transmit(&slot, &read_command().to_bytes()).unwrap();
        assert_eq!(response, hex!("31 14 30 12 90 00"));
        assert_eq!(channel.secure_messaging().send_sequence_counter(), &hex!("00000000 00000000 00000000 00000004"));

        assert_eq!(card.received, vec![select_command(), read_command()]);
    }

    #[test]
    fn status_only_responses() {
        let mut card = SecureCard::new(&[]);
        let sm = SecureMessaging::new(CipherAndMac::Aes128, &K_ENC, &K_MAC).unwrap();
        let mut channel = SecureChannel::new(&mut card, sm);
        let response = channel.transmit(&SlotHandle::default(), &select_command().to_bytes()).unwrap();
        assert_eq!(response, hex!("90 00"));
    }

    #[test]
    fn tampered_mac_invalidates() {
        let mut card = SecureCard::new(&hex!("01 02 03"));
        card.tamper_mac = true;
        let sm = SecureMessaging::new(CipherAndMac::Aes128, &K_ENC, &K_MAC).unwrap();
        let mut channel = SecureChannel::new(&mut card, sm);
        let slot = SlotHandle::default();

        let error = channel.transmit(&slot, &read_command().to_bytes()).unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::ResponseMac)));
        assert!(channel.secure_messaging().is_invalidated());

        let error = channel.transmit(&slot, &read_command().to_bytes()).unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Invalidated)));
        assert_eq!(card.received.len(), 1);
    }

    #[test]
    fn missing_status_is_rejected() {
        let mut card = SecureCard::new(&hex!("01 02 03"));
        card.omit_status = true;
        let mut sm = SecureMessaging::new(CipherAndMac::Aes128, &K_ENC, &K_MAC).unwrap();
        let command = sm.protect(&read_command()).unwrap();
        let raw = card.transmit(&SlotHandle::default(), &command.to_bytes()).unwrap();
        let response = Response::from_bytes(&raw).unwrap();
        assert!(matches!(sm.unprotect(&response), Err(Error::MissingResponseStatus)));
        assert!(matches!(sm.protect(&read_command()), Err(Error::Invalidated)));
    }

    #[test]
    fn unprotected_errors_invalidate() {
        let mut sm = SecureMessaging::new(CipherAndMac::Aes128, &K_ENC, &K_MAC).unwrap();
        sm.protect(&read_command()).unwrap();
        let result = sm.unprotect(&Response::new(Vec::new(), StatusWord::new(0x69, 0x88)));
        assert!(matches!(result, Err(Error::Unprotected { status }) if status == StatusWord::new(0x69, 0x88)));
        assert!(sm.is_invalidated());

        let mut sm = SecureMessaging::new(CipherAndMac::Aes128, &K_ENC, &K_MAC).unwrap();
        assert!(matches!(sm.unprotect(&Response::new(hex!("99 02").to_vec(), StatusWord::new(0x90, 0x00))), Err(Error::ResponseTlvFormat)));
        assert!(matches!(sm.unprotect(&Response::new(hex!("99 02 90 00").to_vec(), StatusWord::new(0x90, 0x00))), Err(Error::Invalidated)));
    }

    #[test]
    fn key_lengths_are_checked() {
        assert!(matches!(
            SecureMessaging::new(CipherAndMac::Aes256, &K_ENC, &K_MAC),
            Err(Error::Crypto(_)),
        ));
    }

    #[test]
    fn counter_carries() {
        let mut sm = SecureMessaging::new(CipherAndMac::Aes128, &K_ENC, &K_MAC).unwrap();
        sm.send_sequence_counter[14..].copy_from_slice(&hex!("00 FF"));
        sm.increment_send_sequence_counter();
        assert_eq!(&sm.send_sequence_counter()[14..], &hex!("01 00"));
    }
}
