//! Filter drivers.
//!
//! Two kinds of driver exist. Sink drivers consume the stream without
//! altering it and accumulate a result, e.g. a byte count. Stream drivers
//! transform bytes between an input and an output buffer; because the two
//! buffers need not be the same size a stream driver must be prepared to be
//! offered the same input again (`input_same`) when its output fills before
//! the input drains, and a driver that buffers state internally signals
//! pending flush output through `done`. Stream drivers should fill the
//! output as much as possible: `input_same` with a non-full output is a
//! contract violation.

use crate::error::CoreResult;
use crate::io::buffer::Buffer;
use serde_json::Value;

pub mod digest;
pub mod rebuffer;
pub mod size;

/// Identifying tag unique per driver kind, used to locate a stage in a
/// chain for result retrieval.
pub type FilterType = &'static str;

/// A driver that observes the stream and produces a result. Since the stage
/// emits no bytes, a result is the only reason it exists and is therefore
/// required.
pub trait SinkFilter {
    fn process(&mut self, input: &[u8]) -> CoreResult<()>;

    /// Typed summary of the stream seen so far.
    fn result(&self) -> Value;
}

/// A driver that transforms bytes. `input` is `None` when the chain is
/// flushing the stage at end of stream; flushing continues until `done`
/// reports true.
pub trait StreamFilter {
    fn process(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> CoreResult<()>;

    /// True when the last input was not fully consumed and the stage must
    /// be offered the same input again with a fresh output.
    fn input_same(&self) -> bool {
        false
    }

    /// True when no internally buffered bytes remain to emit.
    fn done(&self) -> bool {
        true
    }

    /// Optional typed summary; most pure transforms have none.
    fn result(&self) -> Option<Value> {
        None
    }
}

pub enum FilterKind {
    Sink(Box<dyn SinkFilter>),
    Stream(Box<dyn StreamFilter>),
}

/// One stage of a filter chain: a type tag plus the driver state behind it.
/// Filters are move-only and are consumed by the chain that runs them.
pub struct Filter {
    filter_type: FilterType,
    kind: FilterKind,
}

impl Filter {
    #[inline]
    pub fn sink<F: SinkFilter + 'static>(filter_type: FilterType, driver: F) -> Filter {
        Filter {
            filter_type,
            kind: FilterKind::Sink(Box::new(driver)),
        }
    }

    #[inline]
    pub fn stream<F: StreamFilter + 'static>(filter_type: FilterType, driver: F) -> Filter {
        Filter {
            filter_type,
            kind: FilterKind::Stream(Box::new(driver)),
        }
    }

    #[inline]
    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    #[inline]
    pub fn is_stream(&self) -> bool {
        match self.kind {
            FilterKind::Stream(_) => true,
            FilterKind::Sink(_) => false,
        }
    }

    #[inline]
    pub(crate) fn kind_mut(&mut self) -> &mut FilterKind {
        &mut self.kind
    }

    /// `input_same` state of a stream driver; sinks never hold input back.
    #[inline]
    pub(crate) fn stream_input_same(&self) -> bool {
        match &self.kind {
            FilterKind::Stream(driver) => driver.input_same(),
            FilterKind::Sink(_) => false,
        }
    }

    /// `done` state of a stream driver; sinks have nothing to flush.
    #[inline]
    pub(crate) fn stream_done(&self) -> bool {
        match &self.kind {
            FilterKind::Stream(driver) => driver.done(),
            FilterKind::Sink(_) => true,
        }
    }

    /// The stage result: always present for sinks, optional for streams.
    pub fn result(&self) -> Option<Value> {
        match &self.kind {
            FilterKind::Sink(driver) => Some(driver.result()),
            FilterKind::Stream(driver) => driver.result(),
        }
    }
}
