//! Reading transparent elementary files.


use tracing::debug;

use crate::iso7816::apdu::{CommandApdu, CommandHeader, StatusWord};
use crate::iso7816::card::{communicate, CommunicationError, Dispatcher, SlotHandle};


/// File identifier of `EF.CardAccess` below the master file.
pub const EF_CARD_ACCESS: u16 = 0x011C;

/// The highest offset reachable with the short READ BINARY encoding (15 bits in P1-P2).
const MAX_OFFSET: usize = 0x7FFF;

/// Number of bytes requested per READ BINARY.
const CHUNK_LENGTH: u32 = 256;


#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("communication failed: {0}")]
    Communication(#[from] CommunicationError),

    #[error("file not found")]
    FileNotFound,

    #[error("SELECT failed with status {status}")]
    SelectFailed { status: StatusWord },

    #[error("READ BINARY failed with status {status}")]
    ReadFailed { status: StatusWord },

    #[error("file is larger than {max} bytes")]
    TooLarge { max: usize },
}


/// SELECT command for an elementary file below the current DF (the MF after reset), without metadata.
pub fn select_ef_under_mf(file_id: u16) -> CommandApdu {
    let header = CommandHeader::new(
        0x00,
        0xA4, // SELECT
        0x02, // select EF under current DF
        0b0000_11_00, // return no metadata, return first or only occurrence
    );
    CommandApdu::with_body(header, Some(file_id.to_be_bytes().to_vec()), None)
        .expect("two bytes of data are within bounds")
}


/// READ BINARY at the given offset of the currently selected file.
pub fn read_binary(offset: u16, expected_length: u32) -> Result<CommandApdu, crate::iso7816::apdu::Error> {
    let offset_bytes = offset.to_be_bytes();
    let header = CommandHeader::new(
        0x00,
        0xB0, // READ BINARY, offset or short EF identifier
        offset_bytes[0] & 0b0111_1111, // top bit clear: offset in curEF
        offset_bytes[1],
    );
    CommandApdu::with_body(header, None, Some(expected_length))
}


/// Selects a transparent elementary file below the master file and reads it completely.
pub fn read_file<D: Dispatcher + ?Sized>(
    dispatcher: &mut D,
    slot: &SlotHandle,
    file_id: u16,
) -> Result<Vec<u8>, ReadError> {
    let select_response = communicate(dispatcher, slot, &select_ef_under_mf(file_id))?;
    match select_response.trailer.to_word() {
        0x9000 | 0x6282 => {},
        0x6A82 => return Err(ReadError::FileNotFound),
        _ => return Err(ReadError::SelectFailed { status: select_response.trailer }),
    }

    let mut contents = Vec::new();
    loop {
        if contents.len() > MAX_OFFSET {
            return Err(ReadError::TooLarge { max: MAX_OFFSET });
        }
        let offset = u16::try_from(contents.len())
            .map_err(|_| ReadError::TooLarge { max: MAX_OFFSET })?;
        let request = read_binary(offset, CHUNK_LENGTH)
            .map_err(CommunicationError::from)?;
        let response = communicate(dispatcher, slot, &request)?;

        match response.trailer.to_word() {
            0x9000 => {},
            // end of file reached before the expected length
            0x6282 => {
                contents.extend(&response.data);
                break;
            },
            // offset beyond the end of the file
            0x6B00 if offset > 0 => break,
            _ => return Err(ReadError::ReadFailed { status: response.trailer }),
        }

        let chunk_length = response.data.len();
        contents.extend(response.data);
        if chunk_length < CHUNK_LENGTH as usize {
            break;
        }
    }

    debug!(file_id = %format!("{:04X}", file_id), length = contents.len(), "read file");
    Ok(contents)
}


#[cfg(test)]
mod tests {
    use super::{read_file, ReadError, EF_CARD_ACCESS};
    use crate::iso7816::card::{Dispatcher, SlotHandle, TransportError};
    use hex_literal::hex;

    struct FileCard {
        contents: Vec<u8>,
        commands: Vec<Vec<u8>>,
    }
    impl Dispatcher for FileCard {
        fn transmit(&mut self, _slot: &SlotHandle, command: &[u8]) -> Result<Vec<u8>, TransportError> {
            self.commands.push(command.to_vec());
            if command[1] == 0xA4 {
                return Ok(if command[5..] == hex!("01 1C") { hex!("90 00").to_vec() } else { hex!("6A 82").to_vec() });
            }
            let offset = usize::from(u16::from_be_bytes([command[2], command[3]]));
            if offset >= self.contents.len() {
                return Ok(hex!("6B 00").to_vec());
            }
            let end = (offset + 256).min(self.contents.len());
            let mut response = self.contents[offset..end].to_vec();
            response.extend(hex!("90 00"));
            Ok(response)
        }
    }

    #[test]
    fn reads_in_chunks() {
        let contents: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let mut card = FileCard { contents: contents.clone(), commands: Vec::new() };
        let read = read_file(&mut card, &SlotHandle::default(), EF_CARD_ACCESS).unwrap();
        assert_eq!(read, contents);
        assert_eq!(card.commands[0], hex!("00 A4 02 0C 02 01 1C"));
        assert_eq!(card.commands[1], hex!("00 B0 00 00 00"));
        assert_eq!(card.commands[2], hex!("00 B0 01 00 00"));
        assert_eq!(card.commands.len(), 3);
    }

    #[test]
    fn exact_chunk_multiple_stops_at_wrong_offset() {
        let contents = vec![0x31; 256];
        let mut card = FileCard { contents: contents.clone(), commands: Vec::new() };
        assert_eq!(read_file(&mut card, &SlotHandle::default(), EF_CARD_ACCESS).unwrap(), contents);
        assert_eq!(card.commands.len(), 3);
    }

    #[test]
    fn missing_file() {
        let mut card = FileCard { contents: Vec::new(), commands: Vec::new() };
        assert!(matches!(
            read_file(&mut card, &SlotHandle::default(), 0x011D),
            Err(ReadError::FileNotFound),
        ));
    }
}
