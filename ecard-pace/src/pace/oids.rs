//! Object identifiers relevant to PACE.


use rasn::types::{ObjectIdentifier, Oid};

use crate::crypt::cipher_mac::CipherAndMac;


macro_rules! pace_oid {
    ($name:ident $(, $number:expr)* $(,)?) => {
        pub const $name: &'static Oid = Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4 $(, $number)*]);
    };
}

pace_oid!(PACE_OID_PREFIX);

pace_oid!(PACE_DH_GM,                       1);
pace_oid!(PACE_DH_GM_3DES_CBC_CBC,          1, 1);
pace_oid!(PACE_DH_GM_AES_CBC_CMAC_128,      1, 2);
pace_oid!(PACE_DH_GM_AES_CBC_CMAC_192,      1, 3);
pace_oid!(PACE_DH_GM_AES_CBC_CMAC_256,      1, 4);

pace_oid!(PACE_ECDH_GM,                     2);
pace_oid!(PACE_ECDH_GM_3DES_CBC_CBC,        2, 1);
pace_oid!(PACE_ECDH_GM_AES_CBC_CMAC_128,    2, 2);
pace_oid!(PACE_ECDH_GM_AES_CBC_CMAC_192,    2, 3);
pace_oid!(PACE_ECDH_GM_AES_CBC_CMAC_256,    2, 4);

pace_oid!(PACE_DH_IM,                       3);
pace_oid!(PACE_DH_IM_3DES_CBC_CBC,          3, 1);
pace_oid!(PACE_DH_IM_AES_CBC_CMAC_128,      3, 2);
pace_oid!(PACE_DH_IM_AES_CBC_CMAC_192,      3, 3);
pace_oid!(PACE_DH_IM_AES_CBC_CMAC_256,      3, 4);

pace_oid!(PACE_ECDH_IM,                     4);
pace_oid!(PACE_ECDH_IM_3DES_CBC_CBC,        4, 1);
pace_oid!(PACE_ECDH_IM_AES_CBC_CMAC_128,    4, 2);
pace_oid!(PACE_ECDH_IM_AES_CBC_CMAC_192,    4, 3);
pace_oid!(PACE_ECDH_IM_AES_CBC_CMAC_256,    4, 4);

// 5 is unused (theoretically DH-CAM)

pace_oid!(PACE_ECDH_CAM,                    6);
pace_oid!(PACE_ECDH_CAM_AES_CBC_CMAC_128,   6, 2);
pace_oid!(PACE_ECDH_CAM_AES_CBC_CMAC_192,   6, 3);
pace_oid!(PACE_ECDH_CAM_AES_CBC_CMAC_256,   6, 4);


/// Copies a static object identifier into an owned one.
pub fn owned_oid(oid: &Oid) -> ObjectIdentifier {
    ObjectIdentifier::new_unchecked(oid.to_vec().into())
}


/// `id-ecPublicKey` from ANSI X9.62, the algorithm of explicit elliptic-curve domain parameters.
pub const EC_PUBLIC_KEY: &'static Oid = Oid::const_new(&[1, 2, 840, 10045, 2, 1]);

/// `prime-field` from ANSI X9.62, the field type of explicit elliptic-curve domain parameters.
pub const PRIME_FIELD: &'static Oid = Oid::const_new(&[1, 2, 840, 10045, 1, 1]);

/// `dhpublicnumber` from ANSI X9.42.
pub const DH_PUBLIC_NUMBER: &'static Oid = Oid::const_new(&[1, 2, 840, 10046, 2, 1]);


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KeyAgreement {
    /// Diffie-Hellman over a MODP group.
    DiffieHellman,

    /// Elliptic-curve Diffie-Hellman.
    EllipticCurveDiffieHellman,
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MappingKind {
    Generic,
    Integrated,
    ChipAuthentication,
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CipherSuite {
    TripleDes,
    Aes128,
    Aes192,
    Aes256,
}
impl CipherSuite {
    /// The cipher and MAC implementation for this suite, if supported.
    pub const fn cipher_and_mac(&self) -> Option<CipherAndMac> {
        match self {
            Self::TripleDes => None,
            Self::Aes128 => Some(CipherAndMac::Aes128),
            Self::Aes192 => Some(CipherAndMac::Aes192),
            Self::Aes256 => Some(CipherAndMac::Aes256),
        }
    }
}


/// A PACE protocol identifier taken apart.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PaceProtocol {
    pub oid: &'static Oid,
    pub key_agreement: KeyAgreement,
    pub mapping: MappingKind,
    pub cipher: CipherSuite,
}
impl PaceProtocol {
    /// Decomposes a full PACE protocol identifier.
    ///
    /// Returns `None` for identifiers outside the PACE arc and for the bare
    /// `id-PACE-<agreement>-<mapping>` prefixes, which do not name a cipher.
    pub fn from_oid(oid: &Oid) -> Option<Self> {
        let prefix_len = PACE_OID_PREFIX.len();
        if oid.len() != prefix_len + 2 || oid[..prefix_len] != PACE_OID_PREFIX[..] {
            return None;
        }

        let (key_agreement, mapping) = match oid[prefix_len] {
            1 => (KeyAgreement::DiffieHellman, MappingKind::Generic),
            2 => (KeyAgreement::EllipticCurveDiffieHellman, MappingKind::Generic),
            3 => (KeyAgreement::DiffieHellman, MappingKind::Integrated),
            4 => (KeyAgreement::EllipticCurveDiffieHellman, MappingKind::Integrated),
            6 => (KeyAgreement::EllipticCurveDiffieHellman, MappingKind::ChipAuthentication),
            _ => return None,
        };
        let cipher = match oid[prefix_len + 1] {
            1 if mapping != MappingKind::ChipAuthentication => CipherSuite::TripleDes,
            2 => CipherSuite::Aes128,
            3 => CipherSuite::Aes192,
            4 => CipherSuite::Aes256,
            _ => return None,
        };

        let oid = ALL_PROTOCOLS.iter()
            .copied()
            .find(|known| **known == *oid)?;
        Some(Self { oid, key_agreement, mapping, cipher })
    }
}


/// Every full PACE protocol identifier.
pub const ALL_PROTOCOLS: [&'static Oid; 19] = [
    PACE_DH_GM_3DES_CBC_CBC, PACE_DH_GM_AES_CBC_CMAC_128,
    PACE_DH_GM_AES_CBC_CMAC_192, PACE_DH_GM_AES_CBC_CMAC_256,
    PACE_ECDH_GM_3DES_CBC_CBC, PACE_ECDH_GM_AES_CBC_CMAC_128,
    PACE_ECDH_GM_AES_CBC_CMAC_192, PACE_ECDH_GM_AES_CBC_CMAC_256,
    PACE_DH_IM_3DES_CBC_CBC, PACE_DH_IM_AES_CBC_CMAC_128,
    PACE_DH_IM_AES_CBC_CMAC_192, PACE_DH_IM_AES_CBC_CMAC_256,
    PACE_ECDH_IM_3DES_CBC_CBC, PACE_ECDH_IM_AES_CBC_CMAC_128,
    PACE_ECDH_IM_AES_CBC_CMAC_192, PACE_ECDH_IM_AES_CBC_CMAC_256,
    PACE_ECDH_CAM_AES_CBC_CMAC_128, PACE_ECDH_CAM_AES_CBC_CMAC_192,
    PACE_ECDH_CAM_AES_CBC_CMAC_256,
];


#[cfg(test)]
mod tests {
    use super::*;
    use rasn::types::Oid;

    #[test]
    fn decompose() {
        let protocol = PaceProtocol::from_oid(PACE_ECDH_GM_AES_CBC_CMAC_128).unwrap();
        assert_eq!(protocol.key_agreement, KeyAgreement::EllipticCurveDiffieHellman);
        assert_eq!(protocol.mapping, MappingKind::Generic);
        assert_eq!(protocol.cipher, CipherSuite::Aes128);

        let protocol = PaceProtocol::from_oid(PACE_DH_IM_3DES_CBC_CBC).unwrap();
        assert_eq!(protocol.key_agreement, KeyAgreement::DiffieHellman);
        assert_eq!(protocol.mapping, MappingKind::Integrated);
        assert_eq!(protocol.cipher.cipher_and_mac(), None);

        for oid in ALL_PROTOCOLS {
            assert_eq!(PaceProtocol::from_oid(oid).unwrap().oid, oid);
        }
    }

    #[test]
    fn reject_foreign_and_partial_identifiers() {
        assert!(PaceProtocol::from_oid(PACE_ECDH_GM).is_none());
        assert!(PaceProtocol::from_oid(EC_PUBLIC_KEY).is_none());
        assert!(PaceProtocol::from_oid(Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 5, 2])).is_none());
        assert!(PaceProtocol::from_oid(Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 6, 1])).is_none());
        assert!(PaceProtocol::from_oid(Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 3, 2, 2])).is_none());
    }
}
