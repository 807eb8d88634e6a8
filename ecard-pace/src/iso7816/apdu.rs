//! Structures related to application protocol data units (APDUs).
//!
//! Lengths follow the cases of ISO/IEC 7816-3:2006 § 12.1.3 and ISO/IEC 7816-4:2013 § 5.1.


use std::fmt;


/// The largest amount of command data that can be sent in a single APDU.
pub const MAX_COMMAND_DATA: usize = 65535;

/// The largest expected response length that can be requested in a single APDU.
pub const MAX_EXPECTED_LENGTH: u32 = 65536;


#[derive(Clone, Debug, Eq, Hash, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("invalid length: {obtained} not in {minimum}..={maximum}")]
    InvalidLength { minimum: usize, maximum: usize, obtained: usize },

    #[error("response of {obtained} bytes is too short to contain a status word")]
    MalformedResponse { obtained: usize },

    #[error("command APDU is malformed")]
    MalformedCommand,
}


#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CommandHeader {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
}
impl CommandHeader {
    /// Bit in the class byte signalling that further commands of the same chain follow.
    pub const CHAINING_BIT: u8 = 0x10;

    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self { cla, ins, p1, p2 }
    }

    pub const fn from_be_u32(value: u32) -> Self {
        let bytes = value.to_be_bytes();
        Self::new(bytes[0], bytes[1], bytes[2], bytes[3])
    }

    pub const fn to_bytes(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    pub const fn to_be_u32(&self) -> u32 {
        u32::from_be_bytes(self.to_bytes())
    }

    pub const fn is_chained(&self) -> bool {
        self.cla & Self::CHAINING_BIT != 0
    }

    pub fn set_chaining(&mut self, chained: bool) {
        if chained {
            self.cla |= Self::CHAINING_BIT;
        } else {
            self.cla &= !Self::CHAINING_BIT;
        }
    }
}
impl fmt::Debug for CommandHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandHeader {} cla: 0x{:02X}, ins: 0x{:02X}, p1: 0x{:02X}, p2: 0x{:02X} {}",
            '{', self.cla, self.ins, self.p1, self.p2, '}',
        )
    }
}


/// The status word (SW1 SW2) trailing every response APDU.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StatusWord {
    pub sw1: u8,
    pub sw2: u8,
}
impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord::new(0x90, 0x00);

    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    pub const fn from_word(word: u16) -> Self {
        let bytes = word.to_be_bytes();
        Self::new(bytes[0], bytes[1])
    }

    pub const fn to_bytes(&self) -> [u8; 2] {
        [self.sw1, self.sw2]
    }

    pub const fn to_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    /// Normal processing, `9000`.
    pub const fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// Warning processing, `62xx` or `63xx`.
    pub const fn is_warning(&self) -> bool {
        matches!(self.sw1, 0x62 | 0x63)
    }

    /// Execution error, `64xx` to `66xx`.
    pub const fn is_execution_error(&self) -> bool {
        matches!(self.sw1, 0x64..=0x66)
    }

    /// Checking error, `67xx` to `6Exx`.
    pub const fn is_checking_error(&self) -> bool {
        self.sw1 >> 4 == 0x6 && matches!(self.sw1 & 0x0F, 0x7..=0xE)
    }

    /// The counter of a `63Cn` warning, usually the number of remaining tries.
    pub const fn retry_counter(&self) -> Option<u8> {
        if self.sw1 == 0x63 && self.sw2 & 0xF0 == 0xC0 {
            Some(self.sw2 & 0x0F)
        } else {
            None
        }
    }
}
impl fmt::Debug for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusWord {} sw1: 0x{:02X}, sw2: 0x{:02X} {}", '{', self.sw1, self.sw2, '}')
    }
}
impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.to_word())
    }
}


fn ensure_length(obtained: usize, minimum: usize, maximum: usize) -> Result<(), Error> {
    if obtained < minimum || obtained > maximum {
        Err(Error::InvalidLength { minimum, maximum, obtained })
    } else {
        Ok(())
    }
}


/// A command APDU.
///
/// The short or extended encoding is picked when the APDU is serialized: extended lengths are used
/// as soon as the data or the expected response length no longer fits into a single byte.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CommandApdu {
    pub header: CommandHeader,
    data: Option<Vec<u8>>,
    expected_length: Option<u32>,
}
impl CommandApdu {
    /// Case 1: header only.
    pub const fn new(header: CommandHeader) -> Self {
        Self { header, data: None, expected_length: None }
    }

    /// Creates an APDU with optional data and optional expected response length.
    ///
    /// An expected length of 0 means "as much as possible", i.e. 256 bytes in the short form or
    /// 65536 bytes in the extended form.
    pub fn with_body(header: CommandHeader, data: Option<Vec<u8>>, expected_length: Option<u32>) -> Result<Self, Error> {
        if let Some(d) = &data {
            ensure_length(d.len(), 1, MAX_COMMAND_DATA)?;
        }
        if let Some(le) = expected_length {
            ensure_length(le as usize, 0, MAX_EXPECTED_LENGTH as usize)?;
        }
        Ok(Self { header, data, expected_length })
    }

    pub fn header(&self) -> &CommandHeader { &self.header }
    pub fn data(&self) -> Option<&[u8]> { self.data.as_deref() }
    pub fn expected_length(&self) -> Option<u32> { self.expected_length }

    /// Whether this APDU requires extended length fields.
    pub fn is_extended(&self) -> bool {
        let long_data = self.data.as_ref().map(|d| d.len() > 255).unwrap_or(false);
        let long_le = self.expected_length.map(|le| le > 256).unwrap_or(false);
        long_data || long_le
    }

    /// Sets or clears the command chaining bit in the class byte.
    pub fn set_chaining(&mut self, chained: bool) {
        self.header.set_chaining(chained);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let extended = self.is_extended();
        let data_len = self.data.as_ref().map(|d| d.len()).unwrap_or(0);
        let mut ret = Vec::with_capacity(4 + 3 + data_len + 3);
        ret.extend(self.header.to_bytes());

        if let Some(data) = &self.data {
            if extended {
                // case 3E/4E: [0x00] [LcMSB] [LcLSB] [Data]
                let length_bytes = (data.len() as u16).to_be_bytes();
                ret.extend([0x00, length_bytes[0], length_bytes[1]]);
            } else {
                // case 3S/4S: [Lc] [Data]
                ret.push(data.len() as u8);
            }
            ret.extend(data);
        }

        if let Some(le) = self.expected_length {
            if extended {
                if self.data.is_none() {
                    // case 2E carries the leading zero byte in front of Le
                    ret.push(0x00);
                }
                // 65536 wraps to 0x0000
                let length_bytes = ((le % 65536) as u16).to_be_bytes();
                ret.extend(length_bytes);
            } else {
                // 256 wraps to 0x00
                ret.push((le % 256) as u8);
            }
        }

        ret
    }

    /// Decodes a command APDU, recognizing all seven cases.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::MalformedCommand);
        }
        let header = CommandHeader::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let body = &bytes[4..];

        fn short_le(b: u8) -> u32 {
            if b == 0 { 256 } else { b.into() }
        }
        fn extended_le(hi: u8, lo: u8) -> u32 {
            match u16::from_be_bytes([hi, lo]) {
                0 => 65536,
                n => n.into(),
            }
        }

        let (data, expected_length) = match body.len() {
            // case 1
            0 => (None, None),
            // case 2S
            1 => (None, Some(short_le(body[0]))),
            // case 2E
            3 if body[0] == 0x00 => (None, Some(extended_le(body[1], body[2]))),
            _ if body[0] != 0x00 => {
                // case 3S/4S
                let lc = usize::from(body[0]);
                let rest = &body[1..];
                if rest.len() == lc {
                    (Some(rest.to_vec()), None)
                } else if rest.len() == lc + 1 {
                    (Some(rest[..lc].to_vec()), Some(short_le(rest[lc])))
                } else {
                    return Err(Error::MalformedCommand);
                }
            },
            _ => {
                // case 3E/4E
                if body.len() < 3 {
                    return Err(Error::MalformedCommand);
                }
                let lc = usize::from(u16::from_be_bytes([body[1], body[2]]));
                if lc == 0 {
                    return Err(Error::MalformedCommand);
                }
                let rest = &body[3..];
                if rest.len() == lc {
                    (Some(rest.to_vec()), None)
                } else if rest.len() == lc + 2 {
                    (Some(rest[..lc].to_vec()), Some(extended_le(rest[lc], rest[lc + 1])))
                } else {
                    return Err(Error::MalformedCommand);
                }
            },
        };

        Ok(Self { header, data, expected_length })
    }
}


/// A response APDU: response data followed by the status word.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Response {
    pub data: Vec<u8>,
    pub trailer: StatusWord,
}
impl Response {
    pub fn new(data: Vec<u8>, trailer: StatusWord) -> Self {
        Self { data, trailer }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 2 {
            return Err(Error::MalformedResponse { obtained: bytes.len() });
        }

        let (data, trailer) = bytes.split_at(bytes.len() - 2);
        Ok(Self {
            data: data.to_vec(),
            trailer: StatusWord::new(trailer[0], trailer[1]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(self.data.len() + 2);
        ret.extend(&self.data);
        ret.extend(self.trailer.to_bytes());
        ret
    }

    pub fn is_success(&self) -> bool {
        self.trailer.is_success()
    }
}


#[cfg(test)]
mod tests {
    use super::{CommandApdu, CommandHeader, Error, Response, StatusWord};
    use hex_literal::hex;

    const HEADER: CommandHeader = CommandHeader::new(0x00, 0x86, 0x00, 0x00);

    #[test]
    fn case_1_is_header_only() {
        let apdu = CommandApdu::new(CommandHeader::from_be_u32(0x0084_0000));
        assert_eq!(apdu.to_bytes(), hex!("00 84 00 00"));
        assert_eq!(CommandApdu::from_bytes(&apdu.to_bytes()).unwrap(), apdu);
    }

    #[test]
    fn short_le_256_encodes_as_zero() {
        let apdu = CommandApdu::with_body(HEADER, None, Some(256)).unwrap();
        assert_eq!(apdu.to_bytes(), hex!("00 86 00 00 00"));

        let zero = CommandApdu::with_body(HEADER, None, Some(0)).unwrap();
        assert_eq!(zero.to_bytes(), hex!("00 86 00 00 00"));

        let decoded = CommandApdu::from_bytes(&apdu.to_bytes()).unwrap();
        assert_eq!(decoded.expected_length(), Some(256));
    }

    #[test]
    fn data_length_boundary() {
        let short = CommandApdu::with_body(HEADER, Some(vec![0xAB; 255]), None).unwrap();
        let short_bytes = short.to_bytes();
        assert!(!short.is_extended());
        assert_eq!(short_bytes.len(), 4 + 1 + 255);
        assert_eq!(short_bytes[4], 0xFF);

        let extended = CommandApdu::with_body(HEADER, Some(vec![0xAB; 256]), None).unwrap();
        let extended_bytes = extended.to_bytes();
        assert!(extended.is_extended());
        assert_eq!(extended_bytes.len(), 4 + 3 + 256);
        assert_eq!(&extended_bytes[4..7], &hex!("00 01 00"));

        assert_eq!(CommandApdu::from_bytes(&short_bytes).unwrap(), short);
        assert_eq!(CommandApdu::from_bytes(&extended_bytes).unwrap(), extended);
    }

    #[test]
    fn extended_data_forces_extended_le() {
        let apdu = CommandApdu::with_body(HEADER, Some(vec![0x01; 300]), Some(65536)).unwrap();
        let bytes = apdu.to_bytes();
        assert_eq!(&bytes[4..7], &hex!("00 01 2C"));
        assert_eq!(&bytes[bytes.len() - 2..], &hex!("00 00"));

        let decoded = CommandApdu::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.data().map(|d| d.len()), Some(300));
        assert_eq!(decoded.expected_length(), Some(65536));
    }

    #[test]
    fn case_2e() {
        let apdu = CommandApdu::with_body(HEADER, None, Some(1000)).unwrap();
        assert_eq!(apdu.to_bytes(), hex!("00 86 00 00 00 03 E8"));
        assert_eq!(CommandApdu::from_bytes(&apdu.to_bytes()).unwrap(), apdu);
    }

    #[test]
    fn rejects_invalid_lengths() {
        assert!(matches!(
            CommandApdu::with_body(HEADER, Some(Vec::new()), None),
            Err(Error::InvalidLength { obtained: 0, .. }),
        ));
        assert!(matches!(
            CommandApdu::with_body(HEADER, Some(vec![0x00; 65536]), None),
            Err(Error::InvalidLength { obtained: 65536, .. }),
        ));
        assert!(matches!(
            CommandApdu::with_body(HEADER, None, Some(65537)),
            Err(Error::InvalidLength { .. }),
        ));
    }

    #[test]
    fn chaining_sets_class_bit() {
        let mut apdu = CommandApdu::with_body(HEADER, Some(hex!("7C 00").to_vec()), Some(256)).unwrap();
        apdu.set_chaining(true);
        assert_eq!(apdu.to_bytes(), hex!("10 86 00 00 02 7C 00 00"));
        assert!(apdu.header().is_chained());
        apdu.set_chaining(false);
        assert_eq!(apdu.header().cla, 0x00);
    }

    #[test]
    fn response_round_trip() {
        let response = Response::from_bytes(&hex!("7C 00 90 00")).unwrap();
        assert_eq!(response.data, hex!("7C 00"));
        assert!(response.is_success());
        assert_eq!(response.to_bytes(), hex!("7C 00 90 00"));

        let status_only = Response::from_bytes(&hex!("69 83")).unwrap();
        assert!(status_only.data.is_empty());
        assert_eq!(status_only.trailer.to_word(), 0x6983);

        assert_eq!(Response::from_bytes(&[0x90]), Err(Error::MalformedResponse { obtained: 1 }));
    }

    #[test]
    fn status_classification() {
        assert!(StatusWord::from_word(0x9000).is_success());
        assert!(StatusWord::from_word(0x6300).is_warning());
        assert!(StatusWord::from_word(0x6283).is_warning());
        assert!(StatusWord::from_word(0x6400).is_execution_error());
        assert!(StatusWord::from_word(0x6B00).is_checking_error());
        assert!(StatusWord::from_word(0x6983).is_checking_error());
        assert!(!StatusWord::from_word(0x6F00).is_checking_error());
        assert!(!StatusWord::from_word(0x9000).is_warning());

        assert_eq!(StatusWord::from_word(0x63C2).retry_counter(), Some(2));
        assert_eq!(StatusWord::from_word(0x6300).retry_counter(), None);
    }
}
