//! Cryptographic functionality.


pub mod cipher_mac;
pub mod elliptic;


use std::cmp::Ordering;

use crypto_bigint::BoxedUint;
use zeroize::Zeroizing;


#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("key has {obtained} bytes, expected {expected}")]
    KeyLength { expected: usize, obtained: usize },

    #[error("data length {obtained} is not a multiple of the block size {block_size}")]
    DataLength { block_size: usize, obtained: usize },
}


/// Decodes an unsigned big-endian integer, sized to the slice.
pub(crate) fn boxed_uint_from_be_slice(slice: &[u8]) -> BoxedUint {
    boxed_uint_from_be_slice_with_precision(slice, 0)
}


/// Decodes an unsigned big-endian integer with at least the given precision.
pub(crate) fn boxed_uint_from_be_slice_with_precision(slice: &[u8], bits_precision: u32) -> BoxedUint {
    // leading zero bytes do not contribute to the value
    let skip = slice.iter().take_while(|b| **b == 0x00).count();
    let trimmed = &slice[skip..];

    // pad to whole limbs
    let wanted_bytes = trimmed.len()
        .max(bits_precision.div_ceil(8) as usize)
        .max(8);
    let padded_len = wanted_bytes.div_ceil(8) * 8;
    let mut padded = Zeroizing::new(vec![0u8; padded_len - trimmed.len()]);
    padded.extend(trimmed);

    let bits = u32::try_from(8 * padded_len).expect("integer precision overflow");
    BoxedUint::from_be_slice(&padded, bits)
        .expect("padded length matches precision")
}


/// Changes the precision of an integer without changing its value.
///
/// The value must fit into the requested precision.
pub(crate) fn resize_uint(value: &BoxedUint, bits_precision: u32) -> BoxedUint {
    match value.bits_precision().cmp(&bits_precision) {
        Ordering::Less => value.widen(bits_precision),
        Ordering::Greater => value.shorten(bits_precision),
        Ordering::Equal => value.clone(),
    }
}


/// Compares two integers regardless of their precision.
pub(crate) fn compare_uints(lhs: &BoxedUint, rhs: &BoxedUint) -> Ordering {
    let bits = lhs.bits_precision().max(rhs.bits_precision());
    resize_uint(lhs, bits).cmp(&resize_uint(rhs, bits))
}


/// Encodes an unsigned integer big-endian into exactly `length` bytes.
///
/// Returns `None` if the value does not fit.
pub(crate) fn uint_to_fixed_be(value: &BoxedUint, length: usize) -> Option<Vec<u8>> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0x00).count();
    let significant = &bytes[skip..];
    if significant.len() > length {
        return None;
    }
    let mut ret = vec![0u8; length - significant.len()];
    ret.extend(significant);
    Some(ret)
}


/// Appends ISO/IEC 9797-1 padding method 2 (`0x80` then zeroes) up to a multiple of `block_size`.
pub fn pad_iso9797_m2(data: &mut Vec<u8>, block_size: usize) {
    data.push(0x80);
    while data.len() % block_size != 0 {
        data.push(0x00);
    }
}


/// Strips ISO/IEC 9797-1 padding method 2, returning `None` if the padding is invalid.
pub fn unpad_iso9797_m2(data: &[u8]) -> Option<&[u8]> {
    let end = data.iter().rposition(|b| *b != 0x00)?;
    if data[end] == 0x80 {
        Some(&data[..end])
    } else {
        None
    }
}


#[cfg(test)]
mod tests {
    use super::{boxed_uint_from_be_slice, compare_uints, pad_iso9797_m2, uint_to_fixed_be, unpad_iso9797_m2};
    use crypto_bigint::BoxedUint;
    use hex_literal::hex;
    use std::cmp::Ordering;

    #[test]
    fn fixed_width_encoding() {
        let value = boxed_uint_from_be_slice(&hex!("00 00 12 34"));
        assert_eq!(uint_to_fixed_be(&value, 4).unwrap(), hex!("00 00 12 34"));
        assert_eq!(uint_to_fixed_be(&value, 2).unwrap(), hex!("12 34"));
        assert!(uint_to_fixed_be(&value, 1).is_none());
    }

    #[test]
    fn compare_across_precisions() {
        let small = BoxedUint::from(5u64);
        let large = boxed_uint_from_be_slice(&hex!("01 00000000 00000000 00000000 00000000"));
        assert_eq!(compare_uints(&small, &large), Ordering::Less);
        assert_eq!(compare_uints(&large, &small), Ordering::Greater);
        assert_eq!(compare_uints(&small, &small.widen(256)), Ordering::Equal);
    }

    #[test]
    fn iso_padding() {
        let mut data = hex!("01 02 03").to_vec();
        pad_iso9797_m2(&mut data, 8);
        assert_eq!(data, hex!("01 02 03 80 00 00 00 00"));
        assert_eq!(unpad_iso9797_m2(&data), Some(&hex!("01 02 03")[..]));

        let mut full = vec![0x11; 8];
        pad_iso9797_m2(&mut full, 8);
        assert_eq!(full.len(), 16);

        assert_eq!(unpad_iso9797_m2(&hex!("01 02 00 00")), None);
        assert_eq!(unpad_iso9797_m2(&hex!("00 00")), None);
    }
}
