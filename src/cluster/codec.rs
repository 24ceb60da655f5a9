//! Serialization service: values and frames to bytes and back.

use crate::utils::GridError;

use bytes::Bytes;

use serde::{de::DeserializeOwned, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

/// Serialized object, the unit of every key and value in the grid.
pub type Data = Bytes;

/// Serializes an object into `Data`.
#[inline]
pub fn to_data<T: Serialize + ?Sized>(obj: &T) -> Result<Data, GridError> {
    Ok(Bytes::from(encode_to_vec(obj)?))
}

/// Deserializes an object out of `Data`.
#[inline]
pub fn to_object<T: DeserializeOwned>(data: &[u8]) -> Result<T, GridError> {
    Ok(decode_from_slice(data)?)
}

#[cfg(test)]
mod codec_tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Book {
        title: String,
        pages: u32,
    }

    #[test]
    fn object_through_bytes() -> Result<(), GridError> {
        let book = Book {
            title: "Dune".into(),
            pages: 412,
        };
        let data = to_data(&book)?;
        assert_eq!(to_object::<Book>(&data)?, book);
        Ok(())
    }

    #[test]
    fn same_object_same_bytes() -> Result<(), GridError> {
        // partitioning relies on key bytes being stable
        assert_eq!(to_data(&("k", 7u8))?, to_data(&("k", 7u8))?);
        Ok(())
    }

    #[test]
    fn garbage_rejected() {
        assert!(to_object::<Book>(&[0xc1, 0x00]).is_err());
    }
}
