use log::*;
use serde::{Deserialize, Serialize};

/// Encoder/decoder for runtime-owned structures (metadata maps, callback
/// envelopes). Invocation payloads never pass through here; the core only
/// frames them.
///
/// The codec is immutable; if it needs state (like a cipher), use inner
/// mutability.
pub trait Codec: Default + Send + Sync + 'static {
    fn encode<T: Serialize>(&self, v: &T) -> Result<Vec<u8>, ()>;

    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()>;
}

/// msgpack codec, the default for control structures
#[derive(Default)]
pub struct MsgpCodec();

impl Codec for MsgpCodec {
    #[inline(always)]
    fn encode<T: Serialize>(&self, v: &T) -> Result<Vec<u8>, ()> {
        match rmp_serde::encode::to_vec_named(v) {
            Ok(buf) => Ok(buf),
            Err(e) => {
                error!("codec encode error: {:?}", e);
                Err(())
            }
        }
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match rmp_serde::decode::from_slice::<T>(buf) {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!("codec decode error: {:?}", e);
                Err(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_metadata_round_trip() {
        let codec = MsgpCodec::default();
        let mut m = BTreeMap::new();
        m.insert("op".to_string(), "register".to_string());
        let buf = codec.encode(&m).expect("encode");
        let back: BTreeMap<String, String> = codec.decode(&buf).expect("decode");
        assert_eq!(m, back);
    }
}
