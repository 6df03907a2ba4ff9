use crate::error::{write_err, CoreResult};
use crate::io::buffer::Buffer;
use crate::io::chain::{FilterChain, Flow};
use serde_json::Value;
use std::io;

/// Push facade over a filter chain: the caller pushes input buffers, the
/// chain transforms them, and transformed bytes drain to a sink endpoint.
/// `close` flushes every stage and must be called before results are read.
pub struct ChainWrite<W> {
    sink: W,
    chain: FilterChain,
    output: Buffer,
}

impl<W: io::Write> ChainWrite<W> {
    pub fn new(sink: W, chain: FilterChain, buffer_size: usize) -> ChainWrite<W> {
        ChainWrite {
            sink,
            chain,
            output: Buffer::allocate(buffer_size),
        }
    }

    /// Pushes one input buffer through the chain.
    pub fn write(&mut self, input: &Buffer) -> CoreResult<()> {
        loop {
            match self.chain.process(input, &mut self.output)? {
                Flow::Done => return Ok(()),
                Flow::Full => self.drain()?,
            }
        }
    }

    /// Flushes the chain and the buffered tail to the sink.
    pub fn close(&mut self) -> CoreResult<()> {
        loop {
            match self.chain.close(&mut self.output)? {
                Flow::Done => break,
                Flow::Full => self.drain()?,
            }
        }

        self.drain()?;
        self.sink.flush().map_err(write_err)
    }

    fn drain(&mut self) -> CoreResult<()> {
        self.sink.write_all(self.output.bytes()).map_err(write_err)?;
        self.output.clear();
        Ok(())
    }

    pub fn result(&self, filter_type: &str) -> CoreResult<Value> {
        self.chain.result(filter_type)
    }
}

/// Pushes one string through a transient writer and flushes it: the
/// convenience composition used for single-shot handle writes.
pub fn write_one_str<W: io::Write>(sink: W, value: &str) -> CoreResult<()> {
    let mut writer = ChainWrite::new(sink, FilterChain::new(value.len().max(1)), value.len().max(1));

    let mut buffer = Buffer::allocate(value.len());
    buffer.append(value.as_bytes());

    writer.write(&buffer)?;
    writer.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::filter::fixtures::{Doubler, Sealer, SEAL_MAGIC};
    use crate::io::filter::size::{SizeFilter, SIZE_FILTER_TYPE};

    fn push_all(writer: &mut ChainWrite<&mut Vec<u8>>, data: &[u8], step: usize) {
        for piece in data.chunks(step) {
            let mut buffer = Buffer::allocate(piece.len());
            buffer.append(piece);
            writer.write(&buffer).unwrap();
        }

        writer.close().unwrap();
    }

    #[test]
    fn test_write_passthrough() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut sink = Vec::new();

        let mut chain = FilterChain::new(16);
        chain.add(SizeFilter::new());

        let mut writer = ChainWrite::new(&mut sink, chain, 8);
        push_all(&mut writer, &data, 9);

        assert_eq!(writer.result(SIZE_FILTER_TYPE).unwrap(), 100u64);

        drop(writer);
        assert_eq!(sink, data);
    }

    #[test]
    fn test_write_transforms_and_flushes() {
        let data = vec![3u8; 40];
        let mut sink = Vec::new();

        let mut chain = FilterChain::new(16);
        chain.add(Doubler::new()).add(Sealer::new(0x3c));

        let mut writer = ChainWrite::new(&mut sink, chain, 11);
        push_all(&mut writer, &data, 7);
        drop(writer);

        let mut expected: Vec<u8> = vec![3u8 ^ 0x3c; 80];
        expected.extend_from_slice(&SEAL_MAGIC);

        assert_eq!(sink, expected);
    }

    #[test]
    fn test_write_one_str() {
        let mut sink = Vec::new();

        write_one_str(&mut sink, "checkpoint\n").unwrap();

        assert_eq!(sink, b"checkpoint\n");
    }
}
