//! Authentication tokens exchanged during mutual authentication.


use rasn::types::Oid;
use subtle::ConstantTimeEq;

use crate::crypt::cipher_mac::{CipherAndMac, MAC_LENGTH};
use crate::pace::error::PaceError;
use crate::tlv::{oid_to_der_bytes, Tag, Tlv};


/// Length of a certification authority reference.
pub const CAR_LENGTH: usize = 14;


/// Encodes the public key data object the token is computed over.
///
/// ```plain
/// 7F49 LL
///     06 LL protocol
///     86 LL public_point
/// ```
pub fn public_key_object(protocol: &Oid, public_key: &[u8]) -> Vec<u8> {
    Tlv::constructed(Tag::PUBLIC_KEY, [
        Tlv::primitive(Tag::OBJECT_IDENTIFIER, oid_to_der_bytes(protocol)),
        Tlv::primitive(Tag::context(0x06), public_key.to_vec()),
    ]).to_bytes()
}


/// Computes the authentication token over the other party's ephemeral public key.
pub fn compute_token(cipher: CipherAndMac, k_mac: &[u8], protocol: &Oid, public_key: &[u8]) -> Result<[u8; MAC_LENGTH], PaceError> {
    let input = public_key_object(protocol, public_key);
    Ok(cipher.mac(&input, k_mac)?)
}


/// Checks a received token against the expected one in constant time.
pub fn verify_token(expected: &[u8], received: &[u8]) -> Result<(), PaceError> {
    if expected.len() == received.len() && bool::from(expected.ct_eq(received)) {
        Ok(())
    } else {
        Err(PaceError::SecurityViolation)
    }
}


/// The parsed response of the mutual authentication step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MutualAuthResponse {
    pub token: Vec<u8>,
    pub current_car: Option<Vec<u8>>,
    pub previous_car: Option<Vec<u8>>,
}


/// Parses `7C { 86 token, [87 car], [88 previous_car] }`.
pub fn parse_mutual_auth_response(response_data: &[u8]) -> Result<MutualAuthResponse, PaceError> {
    let outer = Tlv::parse(response_data)?;
    outer.expect_tag(Tag::DYNAMIC_AUTHENTICATION_DATA)?;

    let field = |number| outer.find_child(Tag::context(number))
        .and_then(|n| n.primitive_value())
        .map(|v| v.to_vec());
    let token = field(0x06)
        .ok_or_else(|| PaceError::MalformedResponse("missing authentication token".to_owned()))?;
    if token.len() != MAC_LENGTH {
        return Err(PaceError::MalformedResponse(format!("authentication token has {} bytes", token.len())));
    }

    let current_car = field(0x07);
    let previous_car = field(0x08);
    for car in current_car.iter().chain(previous_car.iter()) {
        if car.len() > CAR_LENGTH {
            return Err(PaceError::MalformedResponse(format!("CAR has {} bytes", car.len())));
        }
    }

    Ok(MutualAuthResponse { token, current_car, previous_car })
}


#[cfg(test)]
mod tests {
    use super::{compute_token, parse_mutual_auth_response, public_key_object, verify_token};
    use crate::crypt::cipher_mac::CipherAndMac;
    use crate::pace::error::PaceError;
    use crate::pace::oids::PACE_ECDH_GM_AES_CBC_CMAC_128;
    use hex_literal::hex;

    const K_MAC: [u8; 16] = hex!("FE251C78 58B356B2 4514B3BD 5F4297D1");
    const TERMINAL_PUBLIC: [u8; 65] = hex!("
        04
        2DB7A64C 0355044E C9DF1905 14C625CB
        A2CEA487 54887122 F3A5EF0D 5EDD301C
        3556F3B3 B186DF10 B857B58F 6A7EB80F
        20BA5DC7 BE1D43D9 BF850149 FBB36462
    ");
    const CHIP_PUBLIC: [u8; 65] = hex!("
        04
        9E880F84 2905B8B3 181F7AF7 CAA9F0EF
        B743847F 44A306D2 D28C1D9E C65DF6DB
        7764B222 77A2EDDC 3C265A9F 018F9CB8
        52E111B7 68B32690 4B59A019 3776F094
    ");

    #[test]
    fn icao_doc9303_part11_secg1_tokens() {
        let object = public_key_object(PACE_ECDH_GM_AES_CBC_CMAC_128, &CHIP_PUBLIC);
        assert_eq!(&object[..17], &hex!("7F49 4F 06 0A 04007F00 07020204 0202 86 41"));

        let t_pcd = compute_token(CipherAndMac::Aes128, &K_MAC, PACE_ECDH_GM_AES_CBC_CMAC_128, &CHIP_PUBLIC).unwrap();
        assert_eq!(t_pcd, hex!("C2B0BD78 D94BA866"));
        let t_picc = compute_token(CipherAndMac::Aes128, &K_MAC, PACE_ECDH_GM_AES_CBC_CMAC_128, &TERMINAL_PUBLIC).unwrap();
        assert_eq!(t_picc, hex!("3ABB9674 BCE93C08"));

        assert_eq!(verify_token(&t_picc, &hex!("3ABB9674 BCE93C08")), Ok(()));
        assert_eq!(verify_token(&t_picc, &hex!("3ABB9674 BCE93C09")), Err(PaceError::SecurityViolation));
        assert_eq!(verify_token(&t_picc, &hex!("3ABB9674")), Err(PaceError::SecurityViolation));
    }

    #[test]
    fn mutual_auth_responses() {
        let plain = parse_mutual_auth_response(&hex!("7C 0A 86 08 3ABB9674BCE93C08")).unwrap();
        assert_eq!(plain.token, hex!("3ABB9674BCE93C08"));
        assert_eq!(plain.current_car, None);
        assert_eq!(plain.previous_car, None);

        let with_cars = parse_mutual_auth_response(&hex!("
            7C 28
                86 08 3ABB9674BCE93C08
                87 0E 4445435643416549443030313032
                88 0C 444543564341654944303031
        ")).unwrap();
        assert_eq!(with_cars.current_car.as_deref(), Some(&b"DECVCAeID00102"[..]));
        assert_eq!(with_cars.previous_car.as_deref(), Some(&b"DECVCAeID001"[..]));

        assert!(matches!(
            parse_mutual_auth_response(&hex!("7C 06 86 04 3ABB9674")),
            Err(PaceError::MalformedResponse(_)),
        ));
        assert!(matches!(
            parse_mutual_auth_response(&hex!("7C 03 87 01 00")),
            Err(PaceError::MalformedResponse(_)),
        ));
        assert!(matches!(
            parse_mutual_auth_response(&hex!("7D 0A 86 08 3ABB9674BCE93C08")),
            Err(PaceError::MalformedTlv(_)),
        ));
    }
}
