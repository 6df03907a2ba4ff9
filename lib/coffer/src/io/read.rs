use crate::error::{read_err, CoreResult};
use crate::io::buffer::Buffer;
use crate::io::chain::{FilterChain, Flow};
use serde_json::Value;
use std::io;

/// Pull facade over a filter chain: bytes are read from a source endpoint,
/// transformed, and handed to the caller's buffer. After the source reports
/// end of stream the chain is flushed; `read` returns 0 once every stage has
/// drained.
pub struct ChainRead<R> {
    source: R,
    chain: FilterChain,
    input: Buffer,
    eof: bool,
}

impl<R: io::Read> ChainRead<R> {
    pub fn new(source: R, chain: FilterChain, buffer_size: usize) -> ChainRead<R> {
        ChainRead {
            source,
            chain,
            input: Buffer::allocate(buffer_size),
            eof: false,
        }
    }

    /// Fills the writable tail of `out` with transformed bytes. Returns the
    /// number of bytes appended; 0 means the stream is fully drained.
    pub fn read(&mut self, out: &mut Buffer) -> CoreResult<usize> {
        let start = out.used();

        while !out.is_full() {
            if self.chain.is_closed() {
                break;
            }

            if !self.eof {
                if !self.chain.input_pending() {
                    self.input.clear();

                    let count = match self.source.read(self.input.write_slice()) {
                        Ok(count) => count,
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => return Err(read_err(err)),
                    };

                    if count == 0 {
                        self.eof = true;
                    } else {
                        self.input.advance(count);
                    }
                }

                if !self.eof || self.chain.input_pending() {
                    self.chain.process(&self.input, out)?;
                    continue;
                }
            }

            if let Flow::Done = self.chain.close(out)? {
                break;
            }
        }

        Ok(out.used() - start)
    }

    /// Result of the named filter stage; available once the stream has
    /// drained.
    pub fn result(&self, filter_type: &str) -> CoreResult<Value> {
        self.chain.result(filter_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::filter::fixtures::{Opener, Sealer, SEAL_MAGIC};
    use crate::io::filter::size::{SizeFilter, SIZE_FILTER_TYPE};
    use std::io::Cursor;

    fn drain<R: io::Read>(reader: &mut ChainRead<R>, out_size: usize) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut out = Buffer::allocate(out_size);

        loop {
            out.clear();

            if reader.read(&mut out).unwrap() == 0 {
                break;
            }

            collected.extend_from_slice(out.bytes());
        }

        collected
    }

    #[test]
    fn test_read_passthrough() {
        let data: Vec<u8> = (0..200u16).map(|byte| byte as u8).collect();

        let mut chain = FilterChain::new(32);
        chain.add(SizeFilter::new());

        let mut reader = ChainRead::new(Cursor::new(data.clone()), chain, 16);

        assert_eq!(drain(&mut reader, 7), data);
        assert_eq!(reader.result(SIZE_FILTER_TYPE).unwrap(), 200u64);
    }

    #[test]
    fn test_read_seal_open_round_trip() {
        let data = vec![42u8; 500];

        let mut seal = FilterChain::new(64);
        seal.add(Sealer::new(0x21));
        let mut sealer = ChainRead::new(Cursor::new(data.clone()), seal, 48);
        let sealed = drain(&mut sealer, 21);

        assert_eq!(sealed.len(), data.len() + SEAL_MAGIC.len());

        let mut open = FilterChain::new(64);
        open.add(Opener::new(0x21));
        let mut opener = ChainRead::new(Cursor::new(sealed), open, 30);

        assert_eq!(drain(&mut opener, 17), data);
    }

    #[test]
    fn test_read_empty_source_flushes() {
        let mut chain = FilterChain::new(16);
        chain.add(Sealer::new(0));

        let mut reader = ChainRead::new(Cursor::new(Vec::new()), chain, 8);

        assert_eq!(drain(&mut reader, 16), &SEAL_MAGIC);
    }

    #[test]
    fn test_read_after_drain_returns_zero() {
        let mut chain = FilterChain::new(16);
        chain.add(SizeFilter::new());

        let mut reader = ChainRead::new(Cursor::new(vec![1, 2, 3]), chain, 8);
        let mut out = Buffer::allocate(8);

        assert_eq!(reader.read(&mut out).unwrap(), 3);
        out.clear();
        assert_eq!(reader.read(&mut out).unwrap(), 0);
        assert_eq!(reader.read(&mut out).unwrap(), 0);
    }
}
