//! Security infos announcing PACE support and their selection.
//!
//! The content of `EF.CardAccess` is a SET OF SecurityInfo structures; the first item of each
//! is always an OID specifying the protocol, but non-PACE items need not adhere to any further
//! structure. The SET is therefore taken apart with the TLV codec and only the entries whose OID
//! is relevant to PACE are decoded further.
//!
//! Specified in ICAO Doc 9303 Part 11 § 9.2 and BSI TR-03110 Part 3 Appendix A.1.


use rasn::{AsnType, Decode, Decoder, Encode};
use rasn::types::{Any, ObjectIdentifier};
use tracing::debug;

use crate::iso7816::card::{Dispatcher, SlotHandle};
use crate::iso7816::file::{read_file, EF_CARD_ACCESS};
use crate::pace::error::PaceError;
use crate::pace::oids::{
    CipherSuite, KeyAgreement, MappingKind, PaceProtocol, PACE_DH_GM, PACE_DH_IM, PACE_ECDH_CAM,
    PACE_ECDH_GM, PACE_ECDH_IM,
};
use crate::tlv::{oid_to_string, Tag, Tlv};


/// Standardized domain parameter identifiers range from 0 to 31; higher values are proprietary.
pub const MAX_STANDARDIZED_PARAMETER_ID: u32 = 31;


/// An item of PACE-related security information.
///
/// Specified in ICAO Doc 9303 Part 11 § 9.2.1.
#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
pub struct PaceInfo {
    pub protocol: ObjectIdentifier,
    pub version: u32,
    pub parameter_id: Option<u32>,
}
impl PaceInfo {
    pub fn new(protocol: ObjectIdentifier, version: u32, parameter_id: Option<u32>) -> Self {
        Self { protocol, version, parameter_id }
    }

    /// The parameter identifier, if it refers to standardized domain parameters.
    pub fn standardized_parameter_id(&self) -> Option<u8> {
        self.parameter_id
            .filter(|id| *id <= MAX_STANDARDIZED_PARAMETER_ID)
            .and_then(|id| u8::try_from(id).ok())
    }
}


/// An item of PACE domain parameter security information.
///
/// `domain_parameter` holds the complete DER encoding of an `AlgorithmIdentifier`.
///
/// Specified in ICAO Doc 9303 Part 11 § 9.2.2.
#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
pub struct PaceDomainParameterInfo {
    pub protocol: ObjectIdentifier,
    pub domain_parameter: Any,
    pub parameter_id: Option<u32>,
}


/// The PACE-relevant content of `EF.CardAccess`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SecurityInfos {
    pub pace_infos: Vec<PaceInfo>,
    pub domain_parameter_infos: Vec<PaceDomainParameterInfo>,

    /// The raw file, as read from the card.
    pub raw: Vec<u8>,
}
impl SecurityInfos {
    /// Decodes the content of `EF.CardAccess`.
    ///
    /// SecurityInfos that do not concern PACE are skipped; PACE SecurityInfos that cannot be
    /// decoded are an error.
    pub fn from_card_access(card_access: &[u8]) -> Result<Self, PaceError> {
        let (set, rest) = Tlv::parse_one(card_access)?;
        set.expect_tag(Tag::SET)?;
        if !rest.is_empty() {
            // some cards pad the file; anything but padding is suspicious
            if rest.iter().any(|b| *b != 0x00 && *b != 0xFF) {
                return Err(PaceError::MalformedTlv("data after the SET of SecurityInfos".to_owned()));
            }
        }

        let mut infos = Self {
            raw: card_access.to_vec(),
            ..Self::default()
        };
        for (entry_index, entry) in set.children().enumerate() {
            if entry.tag() != Tag::SEQUENCE {
                debug!(entry_index, tag = %entry.tag(), "skipping SecurityInfo that is not a SEQUENCE");
                continue;
            }
            let Some(oid_node) = entry.first_child().filter(|c| c.tag() == Tag::OBJECT_IDENTIFIER) else {
                debug!(entry_index, "skipping SecurityInfo without protocol");
                continue;
            };
            let protocol: ObjectIdentifier = rasn::der::decode(&oid_node.to_bytes())
                .map_err(|e| PaceError::MalformedTlv(format!("SecurityInfo {} protocol: {}", entry_index, e)))?;

            let entry_bytes = entry.to_bytes();
            if PaceProtocol::from_oid(&protocol).is_some() {
                let pace_info: PaceInfo = rasn::der::decode(&entry_bytes)
                    .map_err(|e| PaceError::MalformedTlv(format!("SecurityInfo {} as PACEInfo: {}", entry_index, e)))?;
                infos.pace_infos.push(pace_info);
            } else if is_domain_parameter_protocol(&protocol) {
                let domain_info: PaceDomainParameterInfo = rasn::der::decode(&entry_bytes)
                    .map_err(|e| PaceError::MalformedTlv(format!("SecurityInfo {} as PACEDomainParameterInfo: {}", entry_index, e)))?;
                infos.domain_parameter_infos.push(domain_info);
            } else {
                debug!(entry_index, protocol = %oid_to_string(&protocol), "skipping SecurityInfo of another protocol");
            }
        }
        Ok(infos)
    }

    /// Whether the card offers more than one PACE parameter set, in which case the one chosen
    /// must be referenced explicitly.
    pub fn is_ambiguous(&self) -> bool {
        self.pace_infos.len() > 1
    }

    /// Chooses the PACE offer to use.
    ///
    /// The first PaceInfo (in the order given by the card) with elliptic-curve key agreement and
    /// an AES cipher wins. If nothing qualifies, the reason the first PaceInfo was rejected is
    /// returned.
    pub fn select(&self) -> Result<PaceSelection, PaceError> {
        let mut first_rejection = None;
        for info in &self.pace_infos {
            match self.qualify(info) {
                Ok(selection) => return Ok(selection),
                Err(e) => {
                    debug!(protocol = %oid_to_string(&info.protocol), error = %e, "not using PACEInfo");
                    first_rejection.get_or_insert(e);
                },
            }
        }
        Err(first_rejection.unwrap_or(PaceError::NoPaceInfo))
    }

    fn qualify(&self, info: &PaceInfo) -> Result<PaceSelection, PaceError> {
        let protocol = PaceProtocol::from_oid(&info.protocol)
            .ok_or_else(|| PaceError::UnsupportedProtocol(oid_to_string(&info.protocol)))?;
        if protocol.mapping == MappingKind::ChipAuthentication {
            return Err(PaceError::UnsupportedProtocol(format!("{} (chip authentication mapping)", oid_to_string(&info.protocol))));
        }
        if protocol.cipher == CipherSuite::TripleDes {
            return Err(PaceError::UnsupportedProtocol(format!("{} (3DES)", oid_to_string(&info.protocol))));
        }
        if protocol.key_agreement == KeyAgreement::DiffieHellman {
            return Err(PaceError::UnsupportedDomainParameters(format!("{} (MODP group)", oid_to_string(&info.protocol))));
        }

        if info.standardized_parameter_id().is_some() {
            return Ok(PaceSelection { info: info.clone(), protocol, domain_parameter_info: None });
        }

        // proprietary or absent parameter ID: the parameters must be supplied explicitly
        let prefix = &info.protocol[..info.protocol.len() - 1];
        let domain_parameter_info = self.domain_parameter_infos.iter()
            .find(|d| d.parameter_id == info.parameter_id && d.protocol[..] == *prefix)
            .ok_or_else(|| PaceError::UnsupportedDomainParameters(format!(
                "no domain parameters for {} with parameter ID {:?}", oid_to_string(&info.protocol), info.parameter_id,
            )))?;
        Ok(PaceSelection { info: info.clone(), protocol, domain_parameter_info: Some(domain_parameter_info.clone()) })
    }
}


fn is_domain_parameter_protocol(oid: &ObjectIdentifier) -> bool {
    [PACE_DH_GM, PACE_ECDH_GM, PACE_DH_IM, PACE_ECDH_IM, PACE_ECDH_CAM]
        .iter()
        .any(|known| **known == **oid)
}


/// A PACE offer chosen from the security infos.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PaceSelection {
    pub info: PaceInfo,
    pub protocol: PaceProtocol,
    pub domain_parameter_info: Option<PaceDomainParameterInfo>,
}


/// Provides the security infos of the card in a slot.
pub trait SecurityInfoSource {
    fn read_security_infos(&mut self, dispatcher: &mut dyn Dispatcher, slot: &SlotHandle) -> Result<SecurityInfos, PaceError>;
}
impl SecurityInfoSource for SecurityInfos {
    fn read_security_infos(&mut self, _dispatcher: &mut dyn Dispatcher, _slot: &SlotHandle) -> Result<SecurityInfos, PaceError> {
        Ok(self.clone())
    }
}


/// Reads and decodes `EF.CardAccess` from the card.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct CardAccessFile;
impl SecurityInfoSource for CardAccessFile {
    fn read_security_infos(&mut self, dispatcher: &mut dyn Dispatcher, slot: &SlotHandle) -> Result<SecurityInfos, PaceError> {
        let card_access = read_file(dispatcher, slot, EF_CARD_ACCESS)
            .map_err(|e| PaceError::UnknownError(format!("failed to read EF.CardAccess: {}", e)))?;
        SecurityInfos::from_card_access(&card_access)
    }
}


#[cfg(test)]
mod tests {
    use super::{CardAccessFile, PaceInfo, SecurityInfoSource, SecurityInfos};
    use crate::iso7816::card::{Dispatcher, SlotHandle, TransportError};
    use crate::pace::error::PaceError;
    use crate::pace::oids::{owned_oid, CipherSuite, PACE_ECDH_GM_AES_CBC_CMAC_128};
    use hex_literal::hex;

    // ICAO Doc 9303 Part 11 Appendix G.1
    const CARD_ACCESS_G1: [u8; 22] = hex!("31 14 30 12 06 0A 04 00 7F 00 07 02 02 04 02 02 02 01 02 02 01 0D");

    #[test]
    fn decode_single_pace_info() {
        let infos = SecurityInfos::from_card_access(&CARD_ACCESS_G1).unwrap();
        assert_eq!(infos.pace_infos.len(), 1);
        assert_eq!(&*infos.pace_infos[0].protocol, PACE_ECDH_GM_AES_CBC_CMAC_128);
        assert_eq!(infos.pace_infos[0].version, 2);
        assert_eq!(infos.pace_infos[0].parameter_id, Some(13));
        assert!(!infos.is_ambiguous());
        assert_eq!(infos.raw, CARD_ACCESS_G1);

        let selection = infos.select().unwrap();
        assert_eq!(selection.protocol.cipher, CipherSuite::Aes128);
        assert!(selection.domain_parameter_info.is_none());
    }

    #[test]
    fn skip_foreign_infos_and_pick_first_supported() {
        let card_access = hex!("
            31 3D
               30 0D 06 08 04 00 7F 00 07 02 02 02 02 01 01
               30 12 06 0A 04 00 7F 00 07 02 02 04 01 02 02 01 02 02 01 00
               30 12 06 0A 04 00 7F 00 07 02 02 04 02 04 02 01 02 02 01 10
               30 04 02 02 01 00
        ");
        let infos = SecurityInfos::from_card_access(&card_access).unwrap();
        assert_eq!(infos.pace_infos.len(), 2);
        assert!(infos.is_ambiguous());

        let selection = infos.select().unwrap();
        assert_eq!(selection.protocol.cipher, CipherSuite::Aes256);
        assert_eq!(selection.info.standardized_parameter_id(), Some(16));
    }

    #[test]
    fn rejections() {
        assert_eq!(SecurityInfos::default().select(), Err(PaceError::NoPaceInfo));

        // DH-GM with AES-128
        let dh = SecurityInfos {
            pace_infos: vec![PaceInfo::new(
                owned_oid(crate::pace::oids::PACE_DH_GM_AES_CBC_CMAC_128),
                2,
                Some(0),
            )],
            ..SecurityInfos::default()
        };
        assert!(matches!(dh.select(), Err(PaceError::UnsupportedDomainParameters(_))));

        // ECDH-GM with 3DES
        let tdes = SecurityInfos {
            pace_infos: vec![PaceInfo::new(
                owned_oid(crate::pace::oids::PACE_ECDH_GM_3DES_CBC_CBC),
                2,
                Some(13),
            )],
            ..SecurityInfos::default()
        };
        assert!(matches!(tdes.select(), Err(PaceError::UnsupportedProtocol(_))));

        // proprietary parameters without matching domain parameter info
        let proprietary = SecurityInfos {
            pace_infos: vec![PaceInfo::new(owned_oid(PACE_ECDH_GM_AES_CBC_CMAC_128), 2, Some(32))],
            ..SecurityInfos::default()
        };
        assert!(matches!(proprietary.select(), Err(PaceError::UnsupportedDomainParameters(_))));
    }

    #[test]
    fn malformed_card_access() {
        assert!(matches!(SecurityInfos::from_card_access(&hex!("30 00")), Err(PaceError::MalformedTlv(_))));
        assert!(matches!(SecurityInfos::from_card_access(&hex!("31 05 30 03 06 01")), Err(PaceError::MalformedTlv(_))));
        // PACE OID without a version
        assert!(matches!(
            SecurityInfos::from_card_access(&hex!("31 0E 30 0C 06 0A 04 00 7F 00 07 02 02 04 02 02")),
            Err(PaceError::MalformedTlv(_)),
        ));
    }

    struct CardAccessCard;
    impl Dispatcher for CardAccessCard {
        fn transmit(&mut self, _slot: &SlotHandle, command: &[u8]) -> Result<Vec<u8>, TransportError> {
            let mut response = match command[1] {
                0xA4 => Vec::new(),
                _ => CARD_ACCESS_G1.to_vec(),
            };
            response.extend(hex!("90 00"));
            Ok(response)
        }
    }

    #[test]
    fn read_from_card() {
        let infos = CardAccessFile.read_security_infos(&mut CardAccessCard, &SlotHandle::default()).unwrap();
        assert_eq!(infos, SecurityInfos::from_card_access(&CARD_ACCESS_G1).unwrap());
    }
}
