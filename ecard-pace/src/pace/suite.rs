//! The cryptographic building blocks of a PACE run.


use std::collections::VecDeque;
use std::fmt;

use crypto_bigint::BoxedUint;
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypt::{boxed_uint_from_be_slice, compare_uints};
use crate::crypt::cipher_mac::CipherAndMac;
use crate::crypt::elliptic::AffinePoint;
use crate::pace::domain::DomainParameters;
use crate::pace::error::PaceError;
use crate::pace::oids::{MappingKind, PaceProtocol};
use crate::tlv::{Tag, Tlv};


/// How often random sampling may land outside `[1, n-1]` before giving up.
const MAX_SAMPLING_ATTEMPTS: usize = 64;


/// Supplies the ephemeral private scalars of a PACE run.
pub trait ScalarSource {
    /// Returns a scalar in `[1, order-1]`.
    fn next_scalar(&mut self, order: &BoxedUint) -> Result<Zeroizing<BoxedUint>, PaceError>;
}


/// Samples scalars from the operating system's random number generator.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomScalars;
impl ScalarSource for RandomScalars {
    fn next_scalar(&mut self, order: &BoxedUint) -> Result<Zeroizing<BoxedUint>, PaceError> {
        let order_bits = order.bits();
        let byte_len = order_bits.div_ceil(8) as usize;
        let excess_bits = byte_len * 8 - order_bits as usize;
        let one = BoxedUint::one();

        let mut bytes = Zeroizing::new(vec![0u8; byte_len]);
        for _ in 0..MAX_SAMPLING_ATTEMPTS {
            OsRng.fill_bytes(bytes.as_mut_slice());
            // drop the bits above the order's top bit
            bytes[0] &= 0xFF >> excess_bits;

            let candidate = Zeroizing::new(boxed_uint_from_be_slice(&bytes));
            if compare_uints(&candidate, &one).is_ge() && compare_uints(&candidate, order).is_lt() {
                return Ok(candidate);
            }
        }
        Err(PaceError::CryptoFailure("failed to sample a private key".to_owned()))
    }
}


/// Hands out predetermined scalars in order; meant for reproducing reference runs.
#[derive(Default)]
pub struct FixedScalars {
    scalars: VecDeque<Zeroizing<BoxedUint>>,
}
impl FixedScalars {
    /// Queues big-endian encoded scalars.
    pub fn from_be_slices<'a>(scalars: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let scalars = scalars.into_iter()
            .map(|s| Zeroizing::new(boxed_uint_from_be_slice(s)))
            .collect();
        Self { scalars }
    }

    pub fn remaining(&self) -> usize { self.scalars.len() }
}
impl ScalarSource for FixedScalars {
    fn next_scalar(&mut self, order: &BoxedUint) -> Result<Zeroizing<BoxedUint>, PaceError> {
        let scalar = self.scalars.pop_front()
            .ok_or_else(|| PaceError::CryptoFailure("no scalars left".to_owned()))?;
        if compare_uints(&scalar, order).is_ge() {
            return Err(PaceError::CryptoFailure("scalar not below the group order".to_owned()));
        }
        Ok(scalar)
    }
}
impl fmt::Debug for FixedScalars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedScalars")
            .field("remaining", &self.scalars.len())
            .finish()
    }
}


/// A key pair on the current domain parameters, or only the public half if the key belongs to the
/// card.
#[derive(Clone)]
pub struct PaceKey {
    private: Option<Zeroizing<BoxedUint>>,
    public: AffinePoint,
}
impl PaceKey {
    /// Generates an ephemeral key pair with a scalar from the given source.
    pub fn generate(domain: &DomainParameters, scalars: &mut dyn ScalarSource) -> Result<Self, PaceError> {
        let private = scalars.next_scalar(domain.curve().order())?;
        Self::from_private(domain, private)
    }

    /// Derives the public key belonging to a private scalar.
    pub fn from_private(domain: &DomainParameters, private: Zeroizing<BoxedUint>) -> Result<Self, PaceError> {
        let curve = domain.curve();
        if bool::from(private.is_zero()) || compare_uints(&private, curve.order()).is_ge() {
            return Err(PaceError::CryptoFailure("private key outside of the group order".to_owned()));
        }
        let public = curve.calculate_public_key(&private)
            .ok_or_else(|| PaceError::CryptoFailure("public key is the point at infinity".to_owned()))?;
        Ok(Self { private: Some(private), public })
    }

    /// Decodes and validates a public key received from the card.
    ///
    /// Anything other than an uncompressed point on the curve is a [`PaceError::SecurityViolation`].
    pub fn decode_public(domain: &DomainParameters, bytes: &[u8]) -> Result<Self, PaceError> {
        let public = domain.curve().decode_point(bytes)
            .ok_or(PaceError::SecurityViolation)?;
        Ok(Self { private: None, public })
    }

    pub fn public(&self) -> &AffinePoint { &self.public }
    pub fn has_private(&self) -> bool { self.private.is_some() }

    fn private(&self) -> Result<&BoxedUint, PaceError> {
        self.private.as_deref()
            .ok_or_else(|| PaceError::CryptoFailure("key has no private part".to_owned()))
    }

    /// The public key as `0x04 || x || y`.
    pub fn encoded_public(&self, domain: &DomainParameters) -> Result<Vec<u8>, PaceError> {
        domain.curve().encode_point(&self.public)
            .ok_or_else(|| PaceError::CryptoFailure("public key does not fit the field".to_owned()))
    }

    /// The compressed representation of the public key: its x coordinate.
    pub fn compressed_public(&self, domain: &DomainParameters) -> Result<Vec<u8>, PaceError> {
        domain.curve().encode_x_coordinate(&self.public)
            .ok_or_else(|| PaceError::CryptoFailure("public key does not fit the field".to_owned()))
    }

    /// Fails with [`PaceError::SecurityViolation`] if both keys share the same public point.
    ///
    /// A card echoing the terminal's own key back is never acceptable.
    pub fn ensure_distinct(&self, peer: &PaceKey) -> Result<(), PaceError> {
        let equal = self.public.x().ct_eq(peer.public.x()) & self.public.y().ct_eq(peer.public.y());
        if bool::from(equal) {
            Err(PaceError::SecurityViolation)
        } else {
            Ok(())
        }
    }
}
impl fmt::Debug for PaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaceKey")
            .field("has_private", &self.private.is_some())
            .field("public", &self.public)
            .finish()
    }
}


/// Extracts the encrypted nonce from a General Authenticate response (`7C { 80 nonce }`) and
/// decrypts it with the password key.
///
/// The nonce is encrypted in CBC mode with an all-zero IV and without padding.
pub fn decrypt_nonce(cipher: CipherAndMac, k_pi: &[u8], response_data: &[u8]) -> Result<Zeroizing<Vec<u8>>, PaceError> {
    let outer = Tlv::parse(response_data)?;
    outer.expect_tag(Tag::DYNAMIC_AUTHENTICATION_DATA)?;
    let encrypted = outer.find_child(Tag::context(0x00))
        .and_then(|n| n.primitive_value())
        .ok_or_else(|| PaceError::MalformedResponse("missing encrypted nonce".to_owned()))?;
    if encrypted.is_empty() {
        return Err(PaceError::MalformedResponse("empty encrypted nonce".to_owned()));
    }

    let iv = vec![0u8; cipher.cipher_block_size()];
    let mut nonce = Zeroizing::new(encrypted.to_vec());
    cipher.decrypt_padded_data(&mut nonce, k_pi, &iv)?;
    Ok(nonce)
}


/// The ways a nonce may be mapped onto the domain parameters.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Mapping {
    Generic,
    Integrated,
}
impl Mapping {
    /// The mapping a protocol calls for.
    pub fn for_protocol(protocol: &PaceProtocol) -> Result<Self, PaceError> {
        match protocol.mapping {
            MappingKind::Generic => Ok(Self::Generic),
            MappingKind::Integrated => Ok(Self::Integrated),
            MappingKind::ChipAuthentication
                => Err(PaceError::UnsupportedProtocol("chip authentication mapping".to_owned())),
        }
    }

    /// Fails early for mappings that cannot be performed, before any card interaction.
    pub fn ensure_supported(&self) -> Result<(), PaceError> {
        match self {
            Self::Generic => Ok(()),
            Self::Integrated => Err(PaceError::NotImplemented("integrated mapping")),
        }
    }

    /// Maps the nonce, returning the ephemeral domain parameters for the key agreement.
    ///
    /// For Generic Mapping:
    /// ```plain
    /// new_generator = nonce * generator + cofactor * own_private * peer_public
    /// ```
    pub fn map(
        &self,
        domain: &DomainParameters,
        own_key: &PaceKey,
        peer_key: &PaceKey,
        nonce: &[u8],
    ) -> Result<DomainParameters, PaceError> {
        self.ensure_supported()?;
        own_key.ensure_distinct(peer_key)?;

        let curve = domain.curve();
        let mut shared_point = curve.diffie_hellman(own_key.private()?, peer_key.public())
            .ok_or_else(|| PaceError::CryptoFailure("mapping point is the point at infinity".to_owned()))?;
        if domain.cofactor() != 1 {
            let cofactor = BoxedUint::from(u64::from(domain.cofactor()));
            shared_point = curve.multiply_point(&cofactor, &shared_point)
                .ok_or_else(|| PaceError::CryptoFailure("mapping point is the point at infinity".to_owned()))?;
        }

        let nonce = Zeroizing::new(boxed_uint_from_be_slice(nonce));
        let mapped = curve.derive_generic_mapping_session_curve(&nonce, &shared_point)
            .ok_or_else(|| PaceError::CryptoFailure("mapped generator is the point at infinity".to_owned()))?;
        Ok(domain.with_generator(mapped.generator().clone()))
    }
}


/// Elliptic-curve Diffie-Hellman; returns the x coordinate of the shared point in field length.
pub fn shared_secret(domain: &DomainParameters, own_key: &PaceKey, peer_key: &PaceKey) -> Result<Zeroizing<Vec<u8>>, PaceError> {
    if domain.cofactor() != 1 {
        return Err(PaceError::NotImplemented("key agreement on curves with a cofactor above 1"));
    }
    let curve = domain.curve();
    let shared_point = curve.diffie_hellman(own_key.private()?, peer_key.public())
        .ok_or_else(|| PaceError::CryptoFailure("shared point is the point at infinity".to_owned()))?;
    let secret = curve.encode_x_coordinate(&shared_point)
        .ok_or_else(|| PaceError::CryptoFailure("shared point does not fit the field".to_owned()))?;
    Ok(Zeroizing::new(secret))
}
