//! Framing protocols: how a list of integers becomes a message body.
//!
//! Both peers must be configured with the same protocol before connecting;
//! nothing on the wire identifies which one is in use.
//!
//! ## Fixed width
//!
//! ```text
//! [5, 3]  ->  00 00 00 05 00 00 00 03
//! ```
//!
//! Each element is a big-endian two's complement `i32`, in list order.
//!
//! ## CBOR
//!
//! The list is a single CBOR array of integers. Values outside the `i32`
//! range and trailing bytes after the array are rejected.

use crate::error::FormatError;
use bytes::{BufMut, Bytes, BytesMut};

/// Width of one encoded element in the fixed-width protocol.
pub const ELEMENT_WIDTH: usize = 4;

/// Body encoding negotiated out-of-band for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// 4 bytes per element, network byte order.
    FixedWidth,
    /// Self-describing CBOR array.
    Cbor,
}

impl Protocol {
    /// Encode a list into a message body.
    pub fn encode(&self, list: &[i32]) -> Result<Bytes, FormatError> {
        match self {
            Protocol::FixedWidth => Ok(encode_fixed(list)),
            Protocol::Cbor => encode_cbor(list),
        }
    }

    /// Decode a complete message body into a list.
    pub fn decode(&self, body: &[u8]) -> Result<Vec<i32>, FormatError> {
        match self {
            Protocol::FixedWidth => decode_fixed(body),
            Protocol::Cbor => decode_cbor(body),
        }
    }
}

fn encode_fixed(list: &[i32]) -> Bytes {
    let mut body = BytesMut::with_capacity(list.len() * ELEMENT_WIDTH);
    for &value in list {
        body.put_i32(value);
    }
    body.freeze()
}

fn decode_fixed(body: &[u8]) -> Result<Vec<i32>, FormatError> {
    if body.len() % ELEMENT_WIDTH != 0 {
        return Err(FormatError::Misaligned {
            len: body.len(),
            width: ELEMENT_WIDTH,
        });
    }

    Ok(body
        .chunks_exact(ELEMENT_WIDTH)
        .map(|chunk| i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn encode_cbor(list: &[i32]) -> Result<Bytes, FormatError> {
    let mut body = Vec::with_capacity(list.len() * 5 + 9);
    ciborium::into_writer(list, &mut body).map_err(|e| FormatError::Encode(e.to_string()))?;
    Ok(Bytes::from(body))
}

fn decode_cbor(body: &[u8]) -> Result<Vec<i32>, FormatError> {
    let mut rest = body;
    let list: Vec<i32> =
        ciborium::from_reader(&mut rest).map_err(|e| FormatError::Decode(e.to_string()))?;

    if !rest.is_empty() {
        return Err(FormatError::Decode(format!(
            "{} trailing bytes after list",
            rest.len()
        )));
    }

    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_layout() {
        let body = Protocol::FixedWidth.encode(&[5, -1]).unwrap();
        assert_eq!(&body[..], &[0, 0, 0, 5, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_fixed_empty() {
        let body = Protocol::FixedWidth.encode(&[]).unwrap();
        assert!(body.is_empty());
        assert_eq!(Protocol::FixedWidth.decode(&body).unwrap(), Vec::<i32>::new());
    }

    #[test]
    fn test_fixed_misaligned() {
        match Protocol::FixedWidth.decode(&[0; 7]) {
            Err(FormatError::Misaligned { len: 7, width: 4 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_cbor_trailing_bytes() {
        let mut body = Protocol::Cbor.encode(&[1, 2, 3]).unwrap().to_vec();
        body.push(0x00);
        assert!(matches!(
            Protocol::Cbor.decode(&body),
            Err(FormatError::Decode(_))
        ));
    }

    #[test]
    fn test_cbor_garbage() {
        assert!(Protocol::Cbor.decode(&[0xff, 0x13, 0x37]).is_err());
    }

    #[test]
    fn test_cbor_rejects_out_of_range() {
        let mut body = Vec::new();
        ciborium::into_writer(&vec![i64::from(i32::MAX) + 1], &mut body).unwrap();
        assert!(Protocol::Cbor.decode(&body).is_err());
    }

    proptest! {
        #[test]
        fn prop_fixed_roundtrip(list in prop::collection::vec(any::<i32>(), 0..512)) {
            let body = Protocol::FixedWidth.encode(&list).unwrap();
            prop_assert_eq!(body.len(), list.len() * ELEMENT_WIDTH);
            prop_assert_eq!(Protocol::FixedWidth.decode(&body).unwrap(), list);
        }

        #[test]
        fn prop_cbor_roundtrip(list in prop::collection::vec(any::<i32>(), 0..512)) {
            let body = Protocol::Cbor.encode(&list).unwrap();
            prop_assert_eq!(Protocol::Cbor.decode(&body).unwrap(), list);
        }
    }
}
