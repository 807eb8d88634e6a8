//! Cipher and MAC (message authentication code) combinations.
//!
//! PACE and Secure Messaging pair AES in CBC mode with AES-CMAC truncated to eight bytes.


use aes::{Aes128, Aes192, Aes256};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use cipher::block_padding::NoPadding;
use cmac::{Cmac, Mac};
use zeroize::Zeroizing;

use crate::crypt::Error;


/// Length of the truncated MACs used by PACE and Secure Messaging.
pub const MAC_LENGTH: usize = 8;


/// Dispatches the same block of code over each AES key size.
macro_rules! with_aes {
    ($cam:expr, $cipher:ident => $body:expr) => {
        match $cam {
            CipherAndMac::Aes128 => { type $cipher = Aes128; $body },
            CipherAndMac::Aes192 => { type $cipher = Aes192; $body },
            CipherAndMac::Aes256 => { type $cipher = Aes256; $body },
        }
    };
}


/// A combination of cipher and MAC usable during authentication and Secure Messaging.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CipherAndMac {
    Aes128,
    Aes192,
    Aes256,
}
impl CipherAndMac {
    /// Size of the cipher key in bytes.
    pub const fn cipher_key_size(&self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// Block size of the cipher in bytes.
    pub const fn cipher_block_size(&self) -> usize { 16 }

    fn check_key(&self, key: &[u8]) -> Result<(), Error> {
        if key.len() != self.cipher_key_size() {
            Err(Error::KeyLength { expected: self.cipher_key_size(), obtained: key.len() })
        } else {
            Ok(())
        }
    }

    fn check_data(&self, data: &[u8]) -> Result<(), Error> {
        if data.len() % self.cipher_block_size() != 0 {
            Err(Error::DataLength { block_size: self.cipher_block_size(), obtained: data.len() })
        } else {
            Ok(())
        }
    }

    /// Decrypts pre-padded data in-place in CBC mode using the given key and IV.
    ///
    /// Does not strip padding.
    pub fn decrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
        self.check_key(key)?;
        self.check_data(data)?;
        let data_len = data.len();
        with_aes!(self, C => {
            let decryptor = cbc::Decryptor::<C>::new_from_slices(key, iv)
                .map_err(|_| Error::KeyLength { expected: self.cipher_block_size(), obtained: iv.len() })?;
            decryptor.decrypt_padded_mut::<NoPadding>(data)
                .map_err(|_| Error::DataLength { block_size: self.cipher_block_size(), obtained: data_len })?;
        });
        Ok(())
    }

    /// Encrypts pre-padded data in-place in CBC mode using the given key and IV.
    pub fn encrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
        self.check_key(key)?;
        self.check_data(data)?;
        let data_len = data.len();
        with_aes!(self, C => {
            let encryptor = cbc::Encryptor::<C>::new_from_slices(key, iv)
                .map_err(|_| Error::KeyLength { expected: self.cipher_block_size(), obtained: iv.len() })?;
            encryptor.encrypt_padded_mut::<NoPadding>(data, data_len)
                .map_err(|_| Error::DataLength { block_size: self.cipher_block_size(), obtained: data_len })?;
        });
        Ok(())
    }

    /// Encrypts a single block with the raw block cipher.
    pub fn encrypt_block(&self, block: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        self.check_key(key)?;
        if block.len() != self.cipher_block_size() {
            return Err(Error::DataLength { block_size: self.cipher_block_size(), obtained: block.len() });
        }
        let mut ret = Zeroizing::new(block.to_vec());
        with_aes!(self, C => {
            let mut cipher = C::new_from_slice(key)
                .map_err(|_| Error::KeyLength { expected: self.cipher_key_size(), obtained: key.len() })?;
            cipher.encrypt_block_mut(cipher::generic_array::GenericArray::from_mut_slice(&mut ret));
        });
        Ok(ret)
    }

    /// Computes the CMAC of the data with the given key, truncated to [`MAC_LENGTH`] bytes.
    pub fn mac(&self, data: &[u8], key: &[u8]) -> Result<[u8; MAC_LENGTH], Error> {
        self.check_key(key)?;
        let full = with_aes!(self, C => {
            let mut mac = <Cmac<C> as Mac>::new_from_slice(key)
                .map_err(|_| Error::KeyLength { expected: self.cipher_key_size(), obtained: key.len() })?;
            mac.update(data);
            mac.finalize().into_bytes()
        });
        let mut ret = [0u8; MAC_LENGTH];
        ret.copy_from_slice(&full[..MAC_LENGTH]);
        Ok(ret)
    }

    /// Verifies a truncated CMAC in constant time.
    pub fn verify_mac(&self, data: &[u8], key: &[u8], expected_mac: &[u8]) -> Result<bool, Error> {
        self.check_key(key)?;
        if expected_mac.len() != MAC_LENGTH {
            return Ok(false);
        }
        let verified = with_aes!(self, C => {
            let mut mac = <Cmac<C> as Mac>::new_from_slice(key)
                .map_err(|_| Error::KeyLength { expected: self.cipher_key_size(), obtained: key.len() })?;
            mac.update(data);
            mac.verify_truncated_left(expected_mac).is_ok()
        });
        Ok(verified)
    }
}


#[cfg(test)]
mod tests {
    use super::CipherAndMac;
    use crate::crypt::Error;
    use hex_literal::hex;

    #[test]
    fn aes128_cbc_zero_iv() {
        // ICAO Doc 9303 Part 11 Appendix G.1: nonce decryption with K_pi
        let k_pi = hex!("89DED1B26624EC1E634C1989302849DD");
        let mut nonce = hex!("95A3A016522EE98D01E76CB6B98B42C3");
        CipherAndMac::Aes128.decrypt_padded_data(&mut nonce, &k_pi, &[0u8; 16]).unwrap();
        assert_eq!(nonce, hex!("3F00C4D39D153F2B2A214A078D899B22"));

        CipherAndMac::Aes128.encrypt_padded_data(&mut nonce, &k_pi, &[0u8; 16]).unwrap();
        assert_eq!(nonce, hex!("95A3A016522EE98D01E76CB6B98B42C3"));
    }

    #[test]
    fn single_block_matches_cbc_with_zero_iv() {
        let key = hex!("000102030405060708090A0B0C0D0E0F");
        let block = hex!("00112233445566778899AABBCCDDEEFF");
        let encrypted = CipherAndMac::Aes128.encrypt_block(&block, &key).unwrap();
        // FIPS-197 Appendix C.1
        assert_eq!(encrypted.as_slice(), &hex!("69C4E0D86A7B0430D8CDB78070B4C55A"));
    }

    #[test]
    fn cmac_is_truncated() {
        // RFC 4493 example 2
        let key = hex!("2B7E151628AED2A6ABF7158809CF4F3C");
        let message = hex!("6BC1BEE22E409F96E93D7E117393172A");
        let mac = CipherAndMac::Aes128.mac(&message, &key).unwrap();
        assert_eq!(mac, hex!("070A16B46B4D4144"));
        assert!(CipherAndMac::Aes128.verify_mac(&message, &key, &mac).unwrap());
        assert!(!CipherAndMac::Aes128.verify_mac(&message, &key, &hex!("070A16B46B4D4145")).unwrap());
    }

    #[test]
    fn rejects_partial_blocks() {
        let mut data = [0u8; 15];
        assert_eq!(
            CipherAndMac::Aes256.decrypt_padded_data(&mut data, &[0u8; 32], &[0u8; 16]),
            Err(Error::DataLength { block_size: 16, obtained: 15 }),
        );
        assert_eq!(
            CipherAndMac::Aes192.mac(&data, &[0u8; 16]),
            Err(Error::KeyLength { expected: 24, obtained: 16 }),
        );
    }
}
