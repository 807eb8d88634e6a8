//! The PACE handshake as an explicit state machine.
//!
//! Every call to [`HandshakeSession::advance`] performs exactly one step:
//!
//! 1. `Init`: choose the PACE offer and resolve its domain parameters (no card interaction)
//! 2. `MseSetAt`: MSE:Set AT selecting protocol, password and optionally parameters and CHAT
//! 3. `EncryptedNonce`: General Authenticate obtaining the encrypted nonce
//! 4. `MapNonce`: General Authenticate exchanging mapping keys; mapping the generator
//! 5. `KeyAgreement`: General Authenticate exchanging ephemeral keys on the mapped generator
//! 6. `MutualAuth`: General Authenticate exchanging authentication tokens
//!
//! A failure in any step moves the session into `Failed`, where it stays.


use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::PaceConfig;
use crate::crypt::cipher_mac::CipherAndMac;
use crate::iso7816::apdu::{CommandApdu, Response, StatusWord};
use crate::iso7816::card::{communicate, Dispatcher, SlotHandle};
use crate::pace::commands::{general_authenticate, mse_set_at};
use crate::pace::domain::{self, DomainParameters};
use crate::pace::error::{Operation, PaceError};
use crate::pace::info::{PaceSelection, SecurityInfoSource, SecurityInfos};
use crate::pace::kdf::{Kdf, Password, PasswordType};
use crate::pace::oids::PaceProtocol;
use crate::pace::suite::{decrypt_nonce, shared_secret, Mapping, PaceKey, RandomScalars, ScalarSource};
use crate::pace::token::{compute_token, parse_mutual_auth_response, verify_token};
use crate::secure_messaging::{self, SecureMessaging};
use crate::tlv::{oid_to_string, Tag, Tlv};


/// The step a handshake session will perform next.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum HandshakeState {
    Init,
    MseSetAt,
    EncryptedNonce,
    MapNonce,
    KeyAgreement,
    MutualAuth,
    Established,
    Failed,
}


/// What the caller supplies to run PACE.
#[derive(Clone, Debug)]
pub struct PaceInput {
    pub password: Password,

    /// An encoded certificate holder authorization template (`7F4C`), if the terminal wants to
    /// restrict its access rights.
    pub chat: Option<Vec<u8>>,
}
impl PaceInput {
    pub fn new(password: Password) -> Self {
        Self { password, chat: None }
    }

    pub fn with_chat(mut self, chat: impl Into<Vec<u8>>) -> Self {
        self.chat = Some(chat.into());
        self
    }
}


/// The keys agreed upon for Secure Messaging.
#[derive(Clone, Eq, PartialEq)]
pub struct SessionKeys {
    pub cipher: CipherAndMac,
    pub k_enc: Zeroizing<Vec<u8>>,
    pub k_mac: Zeroizing<Vec<u8>>,
}
impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}


/// The outcome of a successful handshake.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EstablishedChannel {
    pub protocol: PaceProtocol,
    pub keys: SessionKeys,

    /// Most recent certification authority reference reported by the card.
    pub current_car: Option<Vec<u8>>,

    /// Previous certification authority reference reported by the card.
    pub previous_car: Option<Vec<u8>>,

    /// The compressed ephemeral public key of the card (`ID_PICC`).
    pub id_picc: Vec<u8>,

    /// Retry counter of the password as reported during MSE:Set AT.
    pub retry_counter: u8,

    /// The raw `EF.CardAccess` the handshake was based on.
    pub card_access: Vec<u8>,
}
impl EstablishedChannel {
    /// Sets up Secure Messaging with the agreed keys and a zero send sequence counter.
    pub fn secure_messaging(&self) -> Result<SecureMessaging, secure_messaging::Error> {
        SecureMessaging::new(self.keys.cipher, &self.keys.k_enc, &self.keys.k_mac)
    }
}


/// The parameters fixed during `Init`.
#[derive(Clone, Debug)]
struct Negotiated {
    selection: PaceSelection,
    cipher: CipherAndMac,
    mapping: Mapping,
    domain: DomainParameters,
    parameter_reference: Option<u8>,
}


enum Stage {
    Init,
    MseSetAt(Negotiated),
    EncryptedNonce(Negotiated),
    MapNonce {
        negotiated: Negotiated,
        nonce: Zeroizing<Vec<u8>>,
    },
    KeyAgreement {
        negotiated: Negotiated,
        mapped: DomainParameters,
    },
    MutualAuth {
        negotiated: Negotiated,
        mapped: DomainParameters,
        own_key: PaceKey,
        card_key: PaceKey,
    },
    Established(EstablishedChannel),
    Failed(PaceError),
}
impl Stage {
    fn state(&self) -> HandshakeState {
        match self {
            Self::Init => HandshakeState::Init,
            Self::MseSetAt(_) => HandshakeState::MseSetAt,
            Self::EncryptedNonce(_) => HandshakeState::EncryptedNonce,
            Self::MapNonce { .. } => HandshakeState::MapNonce,
            Self::KeyAgreement { .. } => HandshakeState::KeyAgreement,
            Self::MutualAuth { .. } => HandshakeState::MutualAuth,
            Self::Established(_) => HandshakeState::Established,
            Self::Failed(_) => HandshakeState::Failed,
        }
    }
}


/// The working state of one PACE run against one card slot.
pub struct HandshakeSession {
    config: Arc<PaceConfig>,
    slot: SlotHandle,
    infos: SecurityInfos,
    input: PaceInput,
    scalars: Box<dyn ScalarSource + Send>,
    retry_counter: u8,
    stage: Stage,
}
impl HandshakeSession {
    pub fn new(config: Arc<PaceConfig>, slot: SlotHandle, infos: SecurityInfos, input: PaceInput) -> Self {
        let retry_counter = config.default_retry_counter;
        Self {
            config,
            slot,
            infos,
            input,
            scalars: Box::new(RandomScalars),
            retry_counter,
            stage: Stage::Init,
        }
    }

    /// Replaces the source of ephemeral private keys.
    pub fn with_scalar_source(mut self, scalars: impl ScalarSource + Send + 'static) -> Self {
        self.scalars = Box::new(scalars);
        self
    }

    pub fn state(&self) -> HandshakeState { self.stage.state() }
    pub fn slot(&self) -> &SlotHandle { &self.slot }
    pub fn retry_counter(&self) -> u8 { self.retry_counter }

    /// The error the session failed with, if it has failed.
    pub fn error(&self) -> Option<&PaceError> {
        match &self.stage {
            Stage::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// The established channel, once the handshake has completed.
    pub fn established(&self) -> Option<&EstablishedChannel> {
        match &self.stage {
            Stage::Established(channel) => Some(channel),
            _ => None,
        }
    }

    /// Performs the next step and returns the state the session is in afterwards.
    ///
    /// Once failed, the session keeps returning the same error; once established, it stays
    /// established.
    pub fn advance<D: Dispatcher + ?Sized>(&mut self, dispatcher: &mut D) -> Result<HandshakeState, PaceError> {
        match &self.stage {
            Stage::Failed(error) => return Err(error.clone()),
            Stage::Established(_) => return Ok(HandshakeState::Established),
            _ => {},
        }

        let before = self.stage.state();
        let stage = std::mem::replace(&mut self.stage, Stage::Init);
        match self.step(stage, dispatcher) {
            Ok(next) => {
                self.stage = next;
                debug!(slot = ?self.slot, from = ?before, to = ?self.stage.state(), "PACE step completed");
                Ok(self.stage.state())
            },
            Err(error) => {
                debug!(slot = ?self.slot, state = ?before, %error, "PACE step failed");
                self.stage = Stage::Failed(error.clone());
                Err(error)
            },
        }
    }

    /// Advances until the channel is established or a step fails.
    pub fn run<D: Dispatcher + ?Sized>(mut self, dispatcher: &mut D) -> Result<EstablishedChannel, PaceError> {
        while self.advance(dispatcher)? != HandshakeState::Established {}
        match self.stage {
            Stage::Established(channel) => Ok(channel),
            _ => Err(PaceError::UnknownError("handshake ended without a channel".to_owned())),
        }
    }

    fn step<D: Dispatcher + ?Sized>(&mut self, stage: Stage, dispatcher: &mut D) -> Result<Stage, PaceError> {
        match stage {
            Stage::Init => self.negotiate().map(Stage::MseSetAt),
            Stage::MseSetAt(negotiated) => {
                self.set_authentication_template(dispatcher, &negotiated)?;
                Ok(Stage::EncryptedNonce(negotiated))
            },
            Stage::EncryptedNonce(negotiated) => {
                let nonce = self.obtain_nonce(dispatcher, &negotiated)?;
                Ok(Stage::MapNonce { negotiated, nonce })
            },
            Stage::MapNonce { negotiated, nonce } => {
                let mapped = self.map_nonce(dispatcher, &negotiated, &nonce)?;
                Ok(Stage::KeyAgreement { negotiated, mapped })
            },
            Stage::KeyAgreement { negotiated, mapped } => {
                let (own_key, card_key) = self.agree_on_keys(dispatcher, &mapped)?;
                Ok(Stage::MutualAuth { negotiated, mapped, own_key, card_key })
            },
            Stage::MutualAuth { negotiated, mapped, own_key, card_key } => {
                self.authenticate_mutually(dispatcher, &negotiated, &mapped, &own_key, &card_key)
                    .map(Stage::Established)
            },
            Stage::Established(channel) => Ok(Stage::Established(channel)),
            Stage::Failed(error) => Err(error),
        }
    }

    fn negotiate(&self) -> Result<Negotiated, PaceError> {
        let selection = self.infos.select()?;
        let cipher = selection.protocol.cipher.cipher_and_mac()
            .ok_or_else(|| PaceError::UnsupportedProtocol(oid_to_string(selection.protocol.oid)))?;
        let mapping = Mapping::for_protocol(&selection.protocol)?;
        let domain = domain::resolve(&selection, &self.config)?;

        let parameter_reference = if self.config.should_reference_parameter_id(self.infos.is_ambiguous()) {
            selection.info.parameter_id
                .map(|id| u8::try_from(id)
                    .map_err(|_| PaceError::UnsupportedDomainParameters(format!("parameter ID {} cannot be referenced", id))))
                .transpose()?
        } else {
            None
        };

        debug!(
            protocol = %oid_to_string(selection.protocol.oid),
            parameters = domain.name(),
            ?parameter_reference,
            "negotiated PACE parameters",
        );
        Ok(Negotiated { selection, cipher, mapping, domain, parameter_reference })
    }

    fn set_authentication_template<D: Dispatcher + ?Sized>(&mut self, dispatcher: &mut D, negotiated: &Negotiated) -> Result<(), PaceError> {
        let password_type = self.input.password.kind();
        let request = mse_set_at(
            negotiated.selection.protocol.oid,
            password_type,
            negotiated.parameter_reference,
            self.input.chat.as_deref(),
        )?;
        let response = communicate(dispatcher, &self.slot, &request)?;
        let status = response.trailer;

        if status.is_success() {
            self.retry_counter = self.config.default_retry_counter;
            return Ok(());
        }
        if status.to_word() == 0x6983 {
            warn!(slot = ?self.slot, ?password_type, "password deactivated");
            return Err(PaceError::PasswordDeactivated);
        }
        match status.retry_counter() {
            Some(0) if password_type == PasswordType::Puk => {
                self.retry_counter = 0;
                Ok(())
            },
            Some(0) => {
                warn!(slot = ?self.slot, ?password_type, "password blocked");
                Err(PaceError::PasswordBlocked)
            },
            Some(1) => {
                warn!(slot = ?self.slot, ?password_type, "password suspended; continuing");
                self.retry_counter = 1;
                Ok(())
            },
            Some(2) => {
                warn!(slot = ?self.slot, ?password_type, retry_counter = 2, "password retry counter decreased; continuing");
                self.retry_counter = 2;
                Ok(())
            },
            Some(n) => {
                self.retry_counter = n;
                Ok(())
            },
            None => Err(PaceError::UnknownError(format!("MSE:Set AT failed with status {}", status))),
        }
    }

    fn obtain_nonce<D: Dispatcher + ?Sized>(&mut self, dispatcher: &mut D, negotiated: &Negotiated) -> Result<Zeroizing<Vec<u8>>, PaceError> {
        let kdf = Kdf::for_cipher(negotiated.cipher);
        let k_pi = kdf.derive_password_key(&self.input.password);

        let request = general_authenticate(None, true)?;
        let response = self.general_authenticate(dispatcher, &request, Operation::ObtainNonce)?;
        decrypt_nonce(negotiated.cipher, &k_pi, &response.data)
            .map_err(|e| match e {
                PaceError::CryptoFailure(message) => PaceError::UnknownError(message),
                other => other,
            })
    }

    fn map_nonce<D: Dispatcher + ?Sized>(&mut self, dispatcher: &mut D, negotiated: &Negotiated, nonce: &[u8]) -> Result<DomainParameters, PaceError> {
        negotiated.mapping.ensure_supported()?;
        let domain = &negotiated.domain;

        let own_key = PaceKey::generate(domain, self.scalars.as_mut())?;
        let own_public = own_key.encoded_public(domain)?;
        let request = general_authenticate(Some((Tag::context(0x01), own_public.as_slice())), true)?;
        let response = self.general_authenticate(dispatcher, &request, Operation::ExchangeMappingPublicKeys)?;

        let card_public = data_object(&response.data, 0x02)?;
        let card_key = PaceKey::decode_public(domain, &card_public)?;
        negotiated.mapping.map(domain, &own_key, &card_key, nonce)
    }

    fn agree_on_keys<D: Dispatcher + ?Sized>(&mut self, dispatcher: &mut D, mapped: &DomainParameters) -> Result<(PaceKey, PaceKey), PaceError> {
        let own_key = PaceKey::generate(mapped, self.scalars.as_mut())?;
        let own_public = own_key.encoded_public(mapped)?;
        let request = general_authenticate(Some((Tag::context(0x03), own_public.as_slice())), true)?;
        let response = self.general_authenticate(dispatcher, &request, Operation::ExchangeEphemeralPublicKeys)?;

        let card_public = data_object(&response.data, 0x04)?;
        let card_key = PaceKey::decode_public(mapped, &card_public)?;
        own_key.ensure_distinct(&card_key)?;
        Ok((own_key, card_key))
    }

    fn authenticate_mutually<D: Dispatcher + ?Sized>(
        &mut self,
        dispatcher: &mut D,
        negotiated: &Negotiated,
        mapped: &DomainParameters,
        own_key: &PaceKey,
        card_key: &PaceKey,
    ) -> Result<EstablishedChannel, PaceError> {
        let cipher = negotiated.cipher;
        let protocol = negotiated.selection.protocol;
        let secret = shared_secret(mapped, own_key, card_key)?;
        let kdf = Kdf::for_cipher(cipher);
        let k_enc = kdf.derive_encryption_key(&secret);
        let k_mac = kdf.derive_mac_key(&secret);

        let own_public = own_key.encoded_public(mapped)?;
        let card_public = card_key.encoded_public(mapped)?;
        let own_token = compute_token(cipher, &k_mac, protocol.oid, &card_public)?;
        let expected_token = compute_token(cipher, &k_mac, protocol.oid, &own_public)?;

        let request = general_authenticate(Some((Tag::context(0x05), &own_token[..])), false)?;
        let response = communicate(dispatcher, &self.slot, &request)?;
        if !response.is_success() {
            return Err(self.classify_authentication_failure(response.trailer));
        }

        let parsed = parse_mutual_auth_response(&response.data)?;
        verify_token(&expected_token, &parsed.token)?;
        if self.input.chat.is_some() && self.config.require_car_with_chat && parsed.current_car.is_none() {
            return Err(PaceError::SecurityViolation);
        }

        Ok(EstablishedChannel {
            protocol,
            keys: SessionKeys { cipher, k_enc, k_mac },
            current_car: parsed.current_car,
            previous_car: parsed.previous_car,
            id_picc: card_key.compressed_public(mapped)?,
            retry_counter: self.retry_counter,
            card_access: self.infos.raw.clone(),
        })
    }

    fn classify_authentication_failure(&mut self, status: StatusWord) -> PaceError {
        if let Some(retry_counter) = status.retry_counter() {
            self.retry_counter = retry_counter;
        }
        let error = match status.to_word() {
            0x63C2 => PaceError::PasswordError,
            0x63C1 => PaceError::PasswordSuspended,
            0x63C0 => PaceError::PasswordBlocked,
            0x6283 => PaceError::PasswordDeactivated,
            _ => return PaceError::AuthenticationFailed { status },
        };
        warn!(slot = ?self.slot, %status, %error, "card rejected the password");
        error
    }

    /// Sends a chained General Authenticate, treating anything but success as a failure of the
    /// given operation.
    fn general_authenticate<D: Dispatcher + ?Sized>(&self, dispatcher: &mut D, request: &CommandApdu, operation: Operation) -> Result<Response, PaceError> {
        let response = communicate(dispatcher, &self.slot, request)?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(PaceError::OperationFailed { operation, status: response.trailer })
        }
    }
}
impl fmt::Debug for HandshakeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeSession")
            .field("slot", &self.slot)
            .field("state", &self.stage.state())
            .field("retry_counter", &self.retry_counter)
            .finish_non_exhaustive()
    }
}


/// Extracts the value of the context-specific data object `number` from dynamic authentication
/// data (`7C`).
fn data_object(response_data: &[u8], number: u32) -> Result<Vec<u8>, PaceError> {
    let outer = Tlv::parse(response_data)?;
    outer.expect_tag(Tag::DYNAMIC_AUTHENTICATION_DATA)?;
    outer.find_child(Tag::context(number))
        .and_then(|n| n.primitive_value())
        .map(|v| v.to_vec())
        .ok_or_else(|| PaceError::MalformedResponse(format!("missing data object 0x{:02X}", 0x80 | number)))
}


/// Reads the security infos of the card and runs PACE on it.
pub fn establish<D: Dispatcher>(
    dispatcher: &mut D,
    slot: &SlotHandle,
    source: &mut dyn SecurityInfoSource,
    input: PaceInput,
    config: Arc<PaceConfig>,
) -> Result<EstablishedChannel, PaceError> {
    let infos = source.read_security_infos(&mut *dispatcher, slot)?;
    HandshakeSession::new(config, slot.clone(), infos, input)
        .run(dispatcher)
}
