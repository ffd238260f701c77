//! Base-128 varint encoding, used for record length prefixes inside a SLOG
//! batch.
//!
//! Unsigned integers are split into 7-bit chunks, least significant chunk
//! first. Non-terminal bytes have the high bit set. Most lengths fit in two
//! bytes, so nothing here is optimized for wide integers.

use crate::buffer::{BufReader, BufWriter, DecodeError};

#[inline]
pub fn encode_varint(mut value: usize, out: &mut impl BufWriter) {
    loop {
        if value < 0x80 {
            out.put_u8(value as u8);
            break;
        } else {
            out.put_u8(((value & 0x7f) | 0x80) as u8);
            value >>= 7;
        }
    }
}

#[inline]
pub fn decode_varint<'a>(reader: &mut impl BufReader<'a>) -> Result<usize, DecodeError> {
    let mut result = 0;
    let mut shift = 0;
    loop {
        let byte = reader.get_u8()?;
        if (byte & 0x80) == 0 {
            result |= (byte as usize) << shift;
            return Ok(result);
        } else {
            result |= ((byte & 0x7f) as usize) << shift;
        }
        shift += 7;
    }
}

/// Number of bytes [`encode_varint`] produces for `value`.
#[inline]
pub fn varint_len(value: usize) -> usize {
    let bits = usize::BITS - value.leading_zeros();
    1 + (bits.saturating_sub(1) / 7) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn varint_roundtrip(val in any::<usize>()) {
            let mut buf = Vec::new();
            encode_varint(val, &mut buf);
            prop_assert_eq!(buf.len(), varint_len(val));
            prop_assert_eq!(val, decode_varint(&mut buf.as_slice()).unwrap());
        }
    }
}
