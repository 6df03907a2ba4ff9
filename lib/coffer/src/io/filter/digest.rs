use crate::error::CoreResult;
use crate::io::filter::{Filter, FilterType, SinkFilter};
use serde_json::Value;

pub const DIGEST_FILTER_TYPE: FilterType = "digest";

/// Computes a cryptographic digest of the stream. The result is the digest
/// rendered as lowercase hex.
pub struct DigestFilter {
    hasher: blake3::Hasher,
}

impl DigestFilter {
    #[inline]
    pub fn new() -> Filter {
        Filter::sink(
            DIGEST_FILTER_TYPE,
            DigestFilter {
                hasher: blake3::Hasher::new(),
            },
        )
    }
}

impl SinkFilter for DigestFilter {
    #[inline]
    fn process(&mut self, input: &[u8]) -> CoreResult<()> {
        self.hasher.update(input);
        Ok(())
    }

    #[inline]
    fn result(&self) -> Value {
        Value::from(self.hasher.finalize().to_hex().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::filter::FilterKind;

    fn digest_of(chunks: &[&[u8]]) -> Value {
        let mut filter = DigestFilter::new();

        if let FilterKind::Sink(driver) = filter.kind_mut() {
            for chunk in chunks {
                driver.process(chunk).unwrap();
            }
        }

        filter.result().unwrap()
    }

    #[test]
    fn test_chunking_is_transparent() {
        let whole = digest_of(&[b"the quick brown fox"]);
        let split = digest_of(&[b"the quick", b" brown", b" fox"]);

        assert_eq!(whole, split);
        assert_ne!(whole, digest_of(&[b"the quick brown fax"]));
    }

    #[test]
    fn test_empty_stream() {
        assert_eq!(
            digest_of(&[]),
            Value::from("af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262")
        );
    }
}
