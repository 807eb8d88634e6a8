//! Key Derivation Functions for PACE.


use std::fmt;

use digest::Digest;
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypt::cipher_mac::CipherAndMac;


/// Counter selecting the session encryption key.
pub const COUNTER_ENC: u32 = 1;

/// Counter selecting the session MAC key.
pub const COUNTER_MAC: u32 = 2;

/// Counter selecting the password key (`K_pi`).
pub const COUNTER_PASSWORD: u32 = 3;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KdfDigest {
    Sha1,
    Sha256,
}


/// A key derivation function.
///
/// The KDF is equivalent to:
/// ```plain
/// keydata = digest(secret || nonce || counter)[0..key_length]
/// ```
/// where `counter` is a 32-bit big-endian integer and `nonce` may be empty.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Kdf {
    pub digest: KdfDigest,
    pub key_length: usize,
}
impl Kdf {
    /// The KDF matching the given cipher, as prescribed by BSI TR-03110 Part 3 Appendix A.2.3.
    pub const fn for_cipher(cipher: CipherAndMac) -> Self {
        match cipher {
            CipherAndMac::Aes128 => Self { digest: KdfDigest::Sha1, key_length: 16 },
            CipherAndMac::Aes192 => Self { digest: KdfDigest::Sha256, key_length: 24 },
            CipherAndMac::Aes256 => Self { digest: KdfDigest::Sha256, key_length: 32 },
        }
    }

    /// The key derivation function itself.
    ///
    /// Keys longer than the digest output are not supported and are cut to the digest length.
    pub fn derive(&self, secret: &[u8], counter: u32, nonce: Option<&[u8]>) -> Zeroizing<Vec<u8>> {
        let hash = match self.digest {
            KdfDigest::Sha1 => Self::hash::<Sha1>(secret, counter, nonce),
            KdfDigest::Sha256 => Self::hash::<Sha256>(secret, counter, nonce),
        };
        let length = self.key_length.min(hash.len());
        Zeroizing::new(hash[..length].to_vec())
    }

    fn hash<D: Digest>(secret: &[u8], counter: u32, nonce: Option<&[u8]>) -> Zeroizing<Vec<u8>> {
        let mut hasher = D::new();
        hasher.update(secret);
        if let Some(nonce) = nonce {
            hasher.update(nonce);
        }
        hasher.update(counter.to_be_bytes());
        Zeroizing::new(hasher.finalize().to_vec())
    }

    /// The key derivation function for encryption purposes.
    pub fn derive_encryption_key(&self, shared_secret: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive(shared_secret, COUNTER_ENC, None)
    }

    /// The key derivation function for message authentication purposes.
    pub fn derive_mac_key(&self, shared_secret: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive(shared_secret, COUNTER_MAC, None)
    }

    /// The password-to-key derivation function.
    pub fn derive_password_key(&self, password: &Password) -> Zeroizing<Vec<u8>> {
        self.derive(&password.key_seed(), COUNTER_PASSWORD, None)
    }
}


/// The kind of password used to run PACE.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PasswordType {
    /// Machine-readable zone: document number, date of birth and date of expiry with check digits.
    Mrz,

    /// Card access number.
    Can,

    Pin,

    /// PIN unblocking key.
    Puk,
}
impl PasswordType {
    /// The password reference sent in MSE:Set AT.
    pub const fn reference(&self) -> u8 {
        match self {
            Self::Mrz => 0x01,
            Self::Can => 0x02,
            Self::Pin => 0x03,
            Self::Puk => 0x04,
        }
    }
}


#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("character {character:?} at index {index} cannot be encoded in ISO-8859-1")]
pub struct PasswordEncodingError {
    pub index: usize,
    pub character: char,
}


/// A PACE password together with its type.
#[derive(Clone, Eq, PartialEq)]
pub struct Password {
    kind: PasswordType,
    secret: Zeroizing<Vec<u8>>,
}
impl Password {
    /// Wraps raw password bytes, which are expected to be ISO-8859-1 encoded.
    pub fn new(kind: PasswordType, secret: impl Into<Vec<u8>>) -> Self {
        Self { kind, secret: Zeroizing::new(secret.into()) }
    }

    /// Encodes the password as ISO-8859-1.
    pub fn from_latin1(kind: PasswordType, secret: &str) -> Result<Self, PasswordEncodingError> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(secret.len()));
        for (index, character) in secret.chars().enumerate() {
            let byte = u8::try_from(u32::from(character))
                .map_err(|_| PasswordEncodingError { index, character })?;
            bytes.push(byte);
        }
        Ok(Self { kind, secret: bytes })
    }

    pub fn kind(&self) -> PasswordType { self.kind }
    pub fn as_bytes(&self) -> &[u8] { &self.secret }

    /// The value fed into the password-to-key derivation.
    ///
    /// For the MRZ, this is the SHA-1 hash of the MRZ information; all other passwords are used
    /// as they are.
    pub fn key_seed(&self) -> Zeroizing<Vec<u8>> {
        match self.kind {
            PasswordType::Mrz => {
                let mut hasher = Sha1::new();
                hasher.update(self.secret.as_slice());
                Zeroizing::new(hasher.finalize().to_vec())
            },
            _ => self.secret.clone(),
        }
    }
}
impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Password")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::{Kdf, KdfDigest, Password, PasswordType, COUNTER_ENC, COUNTER_MAC, COUNTER_PASSWORD};
    use crate::crypt::cipher_mac::CipherAndMac;
    use hex_literal::hex;

    #[test]
    fn icao_doc9303_part11_secg1_password_key() {
        let password = Password::new(PasswordType::Mrz, b"T22000129364081251010318".to_vec());
        assert_eq!(password.key_seed().as_slice(), &hex!("7E2D2A41 C74EA0B3 8CD36F86 3939BFA8 E9032AAD"));

        let kdf = Kdf::for_cipher(CipherAndMac::Aes128);
        assert_eq!(kdf.derive_password_key(&password).as_slice(), &hex!("89DED1B2 6624EC1E 634C1989 302849DD"));
    }

    #[test]
    fn icao_doc9303_part11_secg1_session_keys() {
        let shared_secret = hex!("
            28768D20 701247DA E81804C9 E780EDE5
            82A9996D B4A31502 0B273319 7DB84925
        ");
        let kdf = Kdf::for_cipher(CipherAndMac::Aes128);
        assert_eq!(kdf.derive_encryption_key(&shared_secret).as_slice(), &hex!("F5F0E35C 0D7161EE 6724EE51 3A0D9A7F"));
        assert_eq!(kdf.derive_mac_key(&shared_secret).as_slice(), &hex!("FE251C78 58B356B2 4514B3BD 5F4297D1"));
    }

    #[test]
    fn deterministic_and_counter_separated() {
        let kdf = Kdf { digest: KdfDigest::Sha256, key_length: 32 };
        let secret = b"shared secret";
        let nonce = hex!("00112233");

        let first = kdf.derive(secret, COUNTER_ENC, Some(&nonce));
        let again = kdf.derive(secret, COUNTER_ENC, Some(&nonce));
        assert_eq!(first, again);
        assert_eq!(first.len(), 32);

        let mac = kdf.derive(secret, COUNTER_MAC, Some(&nonce));
        let password = kdf.derive(secret, COUNTER_PASSWORD, Some(&nonce));
        assert_ne!(first, mac);
        assert_ne!(first, password);
        assert_ne!(mac, password);

        assert_ne!(first, kdf.derive(secret, COUNTER_ENC, None));
    }

    #[test]
    fn key_lengths_follow_cipher() {
        assert_eq!(Kdf::for_cipher(CipherAndMac::Aes192).derive_encryption_key(b"k").len(), 24);
        assert_eq!(Kdf::for_cipher(CipherAndMac::Aes256).derive_mac_key(b"k").len(), 32);
        assert_eq!(Kdf::for_cipher(CipherAndMac::Aes128).digest, KdfDigest::Sha1);
    }

    #[test]
    fn latin1_passwords() {
        let can = Password::from_latin1(PasswordType::Can, "123456").unwrap();
        assert_eq!(can.as_bytes(), b"123456");
        assert_eq!(can.key_seed().as_slice(), b"123456");

        let umlaut = Password::from_latin1(PasswordType::Pin, "\u{e4}").unwrap();
        assert_eq!(umlaut.as_bytes(), &[0xE4]);

        let error = Password::from_latin1(PasswordType::Pin, "12\u{20ac}").unwrap_err();
        assert_eq!(error.index, 2);
        assert_eq!(error.character, '\u{20ac}');

        assert!(!format!("{:?}", can).contains("123456"));
    }
}
