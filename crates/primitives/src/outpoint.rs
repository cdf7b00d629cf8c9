use keeld_consensus::{Hash256, NULL_HASH};

use crate::encoding::{DecodeError, Decoder, Encoder};

/// Reference to one output slot of a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

/// Index value a coinbase input carries in place of a real output.
pub const NULL_INDEX: u32 = u32::MAX;

impl OutPoint {
    pub fn null() -> Self {
        Self {
            hash: NULL_HASH,
            index: NULL_INDEX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash == NULL_HASH && self.index == NULL_INDEX
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.hash);
        encoder.write_u32_le(self.index);
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let hash = decoder.read_hash()?;
        let index = decoder.read_u32_le()?;
        Ok(Self { hash, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_outpoint_roundtrip() {
        let null = OutPoint::null();
        assert!(null.is_null());

        let mut encoder = Encoder::new();
        null.encode_into(&mut encoder);
        let bytes = encoder.into_inner();
        assert_eq!(bytes.len(), 36);

        let mut decoder = Decoder::new(&bytes);
        let decoded = OutPoint::decode_from(&mut decoder).expect("decode");
        assert!(decoded.is_null());
    }
}
