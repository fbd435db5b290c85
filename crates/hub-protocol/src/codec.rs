//! The encode/decode seam between typed payloads and wire bytes.
//!
//! [`PacketType`](crate::packet::PacketType) carries an `Arc<dyn Codec<T>>`;
//! the type-erased side lives in the dispatcher, which re-imposes the
//! concrete decode path at handler-registration time.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bytebuffer::{BufferError, ByteReader, ByteWriter};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("buffer: {0}")]
    Buffer(#[from] BufferError),
    #[error("{0}")]
    Invalid(String),
}

pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, data: &[u8]) -> Result<T, CodecError>;
}

/// UTF-8 JSON via serde.  Covers scalars, arrays and maps alike.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, data: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Identity: the payload already is raw bytes.
pub struct RawCodec;

impl Codec<Vec<u8>> for RawCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(value.clone())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
}

/// Hand-written binary layout built on [`ByteWriter`]/[`ByteReader`].
pub trait Wire: Sized {
    fn write(&self, writer: &mut ByteWriter);
    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError>;
}

/// Adapts a [`Wire`] type into a [`Codec`], enforcing full consumption.
pub struct WireCodec<T>(PhantomData<fn() -> T>);

impl<T> WireCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for WireCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Wire + Send + Sync> Codec<T> for WireCodec<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let mut writer = ByteWriter::new();
        value.write(&mut writer);
        Ok(writer.finish().to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<T, CodecError> {
        let mut reader = ByteReader::new(data);
        let value = T::read(&mut reader)?;
        reader.finish().map_err(CodecError::from)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonCodec::<Vec<String>>::new();
        let value = vec!["a".to_owned(), "b".to_owned()];
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
        assert!(codec.decode(b"{not json").is_err());
    }

    #[test]
    fn wire_codec_rejects_trailing_bytes() {
        struct Pair(u16, u16);
        impl Wire for Pair {
            fn write(&self, writer: &mut ByteWriter) {
                writer.write_u16(self.0);
                writer.write_u16(self.1);
            }
            fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
                Ok(Pair(reader.read_u16()?, reader.read_u16()?))
            }
        }
        let codec = WireCodec::<Pair>::new();
        let bytes = codec.encode(&Pair(7, 9)).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!((back.0, back.1), (7, 9));
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(codec.decode(&longer).is_err());
    }
}
