use crate::parser::{header_bytes, ZerdeParser};
use crate::{ZerdeError, ZerdeResult, HEADER_SLOTS};

/// Owned, finished Zerde message.
///
/// The word vector covers exactly the byte length in the header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMessage {
    words: Vec<u32>,
}

impl WireMessage {
    pub(crate) fn from_words_unchecked(words: Vec<u32>) -> Self {
        Self { words }
    }

    /// Wraps words produced elsewhere, validating the header.
    pub fn from_words(mut words: Vec<u32>) -> ZerdeResult<Self> {
        let bytes = header_bytes(&words)?;
        let available = words.len() * 4;
        if bytes % 4 != 0 || bytes < HEADER_SLOTS as u64 * 4 || bytes > available as u64 {
            return Err(ZerdeError::InvalidHeader { bytes, available });
        }
        words.truncate((bytes / 4) as usize);
        Ok(Self { words })
    }

    /// Decodes the little-endian byte layout (8-byte header, then slots).
    pub fn from_bytes(bytes: &[u8]) -> ZerdeResult<Self> {
        if bytes.len() % 4 != 0 {
            return Err(ZerdeError::InvalidHeader {
                bytes: bytes.len() as u64,
                available: bytes.len(),
            });
        }
        let words = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Self::from_words(words)
    }

    /// Little-endian byte layout of the whole message.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|word| word.to_le_bytes()).collect()
    }

    pub fn as_words(&self) -> &[u32] {
        &self.words
    }

    /// Byte length recorded in the header.
    pub fn byte_len(&self) -> usize {
        self.words.len() * 4
    }

    pub fn parser(&self) -> ZerdeResult<ZerdeParser<'_>> {
        ZerdeParser::new(&self.words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ZerdeBuilder;

    #[test]
    fn byte_layout_starts_with_le_length_header() {
        let mut builder = ZerdeBuilder::with_slots(4);
        builder.send_u32(0xAABB_CCDD).expect("u32");
        let bytes = builder.into_message().to_bytes();
        assert_eq!(&bytes[..8], &16u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &[0xDD, 0xCC, 0xBB, 0xAA]);
        let decoded = WireMessage::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded.parser().expect("parser").parse_u32(), Ok(0xAABB_CCDD));
    }

    #[test]
    fn rejects_ragged_byte_buffers() {
        assert!(matches!(
            WireMessage::from_bytes(&[0; 10]),
            Err(ZerdeError::InvalidHeader { .. })
        ));
    }
}
