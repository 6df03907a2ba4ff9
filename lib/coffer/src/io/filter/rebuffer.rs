use crate::error::CoreResult;
use crate::io::buffer::Buffer;
use crate::io::filter::{Filter, FilterType, StreamFilter};

pub const REBUFFER_FILTER_TYPE: FilterType = "rebuffer";

/// Copies bytes unchanged between unequally sized input and output buffers.
/// This is the reference `input_same` implementation: when the output fills
/// before the input drains the driver remembers its offset into the input
/// and asks for the same input again.
pub struct RebufferFilter {
    offset: usize,
    input_same: bool,
}

impl RebufferFilter {
    #[inline]
    pub fn new() -> Filter {
        Filter::stream(
            REBUFFER_FILTER_TYPE,
            RebufferFilter {
                offset: 0,
                input_same: false,
            },
        )
    }
}

impl StreamFilter for RebufferFilter {
    fn process(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> CoreResult<()> {
        let input = match input {
            Some(input) => input,
            // Nothing is held between inputs, so a flush is a no-op.
            None => return Ok(()),
        };

        let count = (input.len() - self.offset).min(output.remaining());
        output.append(&input[self.offset..self.offset + count]);
        self.offset += count;

        if self.offset == input.len() {
            self.offset = 0;
            self.input_same = false;
        } else {
            self.input_same = true;
        }

        Ok(())
    }

    #[inline]
    fn input_same(&self) -> bool {
        self.input_same
    }
}
