//! Element encoding for the on-disk format.
//!
//! Integers and floats are fixed-width little-endian. Strings and byte
//! vectors carry their own `u32` length prefix, so the stored element is
//! `[u32 len][bytes]` inside the outer length-prefixed slot.

use crate::CompactMapError;

pub trait Codec: Sized {
    fn encode(&self, out: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> Result<Self, CompactMapError>;
}

macro_rules! fixed_width_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Codec for $ty {
                fn encode(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn decode(bytes: &[u8]) -> Result<Self, CompactMapError> {
                    const WIDTH: usize = std::mem::size_of::<$ty>();
                    let Some(raw) = bytes.get(..WIDTH) else {
                        return Err(CompactMapError::Truncated {
                            needed: WIDTH,
                            available: bytes.len(),
                        });
                    };
                    let mut buf = [0u8; WIDTH];
                    buf.copy_from_slice(raw);
                    Ok(<$ty>::from_le_bytes(buf))
                }
            }
        )*
    };
}

fixed_width_codec!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

fn encode_prefixed(bytes: &[u8], out: &mut Vec<u8>) {
    // Lengths past u32::MAX cannot be represented; `save` rejects them first.
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn decode_prefixed(bytes: &[u8]) -> Result<&[u8], CompactMapError> {
    let len = u32::decode(bytes)? as usize;
    bytes
        .get(4..4 + len)
        .ok_or(CompactMapError::Truncated {
            needed: 4 + len,
            available: bytes.len(),
        })
}

impl Codec for String {
    fn encode(&self, out: &mut Vec<u8>) {
        encode_prefixed(self.as_bytes(), out);
    }

    fn decode(bytes: &[u8]) -> Result<Self, CompactMapError> {
        let raw = decode_prefixed(bytes)?;
        String::from_utf8(raw.to_vec()).map_err(|e| CompactMapError::InvalidUtf8(e.utf8_error()))
    }
}

impl Codec for Vec<u8> {
    fn encode(&self, out: &mut Vec<u8>) {
        encode_prefixed(self, out);
    }

    fn decode(bytes: &[u8]) -> Result<Self, CompactMapError> {
        decode_prefixed(bytes).map(<[u8]>::to_vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded<T: Codec>(value: &T) -> Vec<u8> {
        let mut out = Vec::new();
        value.encode(&mut out);
        out
    }

    #[test]
    fn integers_are_fixed_width_little_endian() {
        assert_eq!(encoded(&0x0102_u16), vec![0x02, 0x01]);
        assert_eq!(encoded(&-1_i32), vec![0xff; 4]);
        assert_eq!(encoded(&7_u64).len(), 8);
    }

    #[test]
    fn strings_carry_an_inner_length_prefix() {
        assert_eq!(encoded(&"hi".to_string()), vec![2, 0, 0, 0, b'h', b'i']);
        assert_eq!(String::decode(&[2, 0, 0, 0, b'h', b'i']).unwrap(), "hi");
    }

    #[test]
    fn short_input_is_reported() {
        assert!(matches!(
            u32::decode(&[1, 2]),
            Err(CompactMapError::Truncated {
                needed: 4,
                available: 2
            })
        ));
        assert!(matches!(
            Vec::<u8>::decode(&[9, 0, 0, 0, 1]),
            Err(CompactMapError::Truncated { .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert!(matches!(
            String::decode(&[1, 0, 0, 0, 0xff]),
            Err(CompactMapError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn floats_keep_their_bits() {
        let bytes = encoded(&1.5_f64);
        assert_eq!(f64::decode(&bytes).unwrap(), 1.5);
        let bytes = encoded(&-0.25_f32);
        assert_eq!(f32::decode(&bytes).unwrap(), -0.25);
    }
}
