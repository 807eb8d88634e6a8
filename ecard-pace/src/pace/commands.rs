//! Command APDUs sent during PACE.


use rasn::types::Oid;

use crate::iso7816::apdu::{self, CommandApdu, CommandHeader};
use crate::pace::kdf::PasswordType;
use crate::tlv::{oid_to_der_bytes, Tag, Tlv};


/// Expected response length of General Authenticate; encodes as `00`.
const GENERAL_AUTHENTICATE_LE: u32 = 256;


/// MANAGE SECURITY ENVIRONMENT: Set Authentication Template for mutual authentication.
///
/// ```plain
/// 80 LL protocol
/// 83 01 password_reference
/// [84 01 parameter_id]
/// [7F4C LL chat]
/// ```
///
/// `chat` is passed on as an encoded `7F4C` object.
pub fn mse_set_at(
    protocol: &Oid,
    password_type: PasswordType,
    parameter_id: Option<u8>,
    chat: Option<&[u8]>,
) -> Result<CommandApdu, apdu::Error> {
    let mut data = Tlv::primitive(Tag::context(0x00), oid_to_der_bytes(protocol)).to_bytes();
    data.extend(Tlv::primitive(Tag::context(0x03), vec![password_type.reference()]).to_bytes());
    if let Some(id) = parameter_id {
        data.extend(Tlv::primitive(Tag::context(0x04), vec![id]).to_bytes());
    }
    if let Some(chat) = chat {
        data.extend(chat);
    }

    let header = CommandHeader::new(
        0x00,
        0x22, // MANAGE SECURITY ENVIRONMENT
        0xC1, // set for verification, encryption and external authentication
        0xA4, // authentication template
    );
    CommandApdu::with_body(header, Some(data), None)
}


/// GENERAL AUTHENTICATE wrapping at most one data object in dynamic authentication data (`7C`).
///
/// All steps but the last are sent with command chaining.
pub fn general_authenticate(data_object: Option<(Tag, &[u8])>, chained: bool) -> Result<CommandApdu, apdu::Error> {
    let children: Vec<Tlv> = data_object
        .map(|(tag, value)| Tlv::primitive(tag, value.to_vec()))
        .into_iter()
        .collect();
    let data = Tlv::constructed(Tag::DYNAMIC_AUTHENTICATION_DATA, children).to_bytes();

    let mut header = CommandHeader::new(
        0x00,
        0x86, // GENERAL AUTHENTICATE
        0x00, // no information given
        0x00, // no information given
    );
    header.set_chaining(chained);
    CommandApdu::with_body(header, Some(data), Some(GENERAL_AUTHENTICATE_LE))
}


#[cfg(test)]
mod tests {
    use super::{general_authenticate, mse_set_at};
    use crate::pace::kdf::PasswordType;
    use crate::pace::oids::PACE_ECDH_GM_AES_CBC_CMAC_128;
    use crate::tlv::Tag;
    use hex_literal::hex;

    #[test]
    fn icao_doc9303_part11_secg1_mse_set_at() {
        let command = mse_set_at(PACE_ECDH_GM_AES_CBC_CMAC_128, PasswordType::Mrz, None, None).unwrap();
        assert_eq!(
            command.to_bytes(),
            hex!("00 22 C1 A4 0F 80 0A 04 00 7F 00 07 02 02 04 02 02 83 01 01"),
        );
    }

    #[test]
    fn mse_set_at_with_parameter_id_and_chat() {
        let chat = hex!("7F4C 12 06 09 04 00 7F 00 07 03 01 02 02 53 05 00 00 00 00 10");
        let command = mse_set_at(PACE_ECDH_GM_AES_CBC_CMAC_128, PasswordType::Pin, Some(13), Some(&chat)).unwrap();
        let data = command.data().unwrap();
        assert_eq!(&data[12..18], &hex!("83 01 03 84 01 0D"));
        assert_eq!(&data[18..], &chat);
        assert_eq!(command.expected_length(), None);
    }

    #[test]
    fn general_authenticate_steps() {
        let nonce_request = general_authenticate(None, true).unwrap();
        assert_eq!(nonce_request.to_bytes(), hex!("10 86 00 00 02 7C 00 00"));

        let token = hex!("C2B0BD78 D94BA866");
        let mutual = general_authenticate(Some((Tag::context(0x05), &token[..])), false).unwrap();
        assert_eq!(mutual.to_bytes(), hex!("00 86 00 00 0C 7C 0A 85 08 C2B0BD78D94BA866 00"));
    }
}
