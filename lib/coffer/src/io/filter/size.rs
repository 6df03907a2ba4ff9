use crate::error::CoreResult;
use crate::io::filter::{Filter, FilterType, SinkFilter};
use serde_json::Value;

pub const SIZE_FILTER_TYPE: FilterType = "size";

/// Counts the bytes that pass through it.
pub struct SizeFilter {
    size: u64,
}

impl SizeFilter {
    #[inline]
    pub fn new() -> Filter {
        Filter::sink(SIZE_FILTER_TYPE, SizeFilter { size: 0 })
    }
}

impl SinkFilter for SizeFilter {
    #[inline]
    fn process(&mut self, input: &[u8]) -> CoreResult<()> {
        self.size += input.len() as u64;
        Ok(())
    }

    #[inline]
    fn result(&self) -> Value {
        Value::from(self.size)
    }
}
