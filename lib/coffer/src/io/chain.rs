use crate::error::{CoreError, CoreResult};
use crate::io::buffer::Buffer;
use crate::io::filter::{Filter, FilterKind};
use serde_json::Value;
use std::mem;

/// Outcome of one chain call. `Full` means the output buffer filled while
/// work is still pending: the caller must call again with the *same* input
/// and a fresh (or emptier) output buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Flow {
    Done,
    Full,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ChainState {
    Open,
    Flushing,
    Closed,
}

/// An ordered composition of filter drivers between a source and a sink
/// endpoint.
///
/// Stream (transform) stages are connected through chain-owned scratch
/// buffers sized to the configured block size; the last stream stage writes
/// directly into the caller's output. Sink stages do not participate in the
/// buffer chain: they tap the stream between two adjacent transforms without
/// altering it.
///
/// Bytes exit in the order they entered, after transformation. The first
/// driver error closes the chain; subsequent operations fail with the same
/// error and consumed input is never replayed.
pub struct FilterChain {
    filters: Vec<Filter>,
    // Indices of stream stages within `filters`.
    streams: Vec<usize>,
    // taps[j] holds the sink indices observing the input of stream stage j;
    // taps[streams.len()] holds the sinks observing the final output.
    taps: Vec<Vec<usize>>,
    // scratch[j] is the downstream buffer of stream stage j (absent for the
    // last stage). Non-empty scratch marks a chunk not yet drained
    // downstream, which is how a paused traversal resumes.
    scratch: Vec<Buffer>,
    // offered[j] is true while stream stage j has an input chunk it has not
    // fully consumed.
    offered: Vec<bool>,
    block_size: usize,
    started: bool,
    state: ChainState,
    error: Option<CoreError>,
    pending_input: bool,
    input_ptr: usize,
    // Resume offset for chains with no stream stages.
    passthrough: usize,
    // Next stream stage to flush once the chain is closing.
    flush_stage: usize,
}

impl FilterChain {
    pub fn new(block_size: usize) -> FilterChain {
        if block_size == 0 {
            panic!("Chain block size must be greater than zero");
        }

        FilterChain {
            filters: Vec::new(),
            streams: Vec::new(),
            taps: Vec::new(),
            scratch: Vec::new(),
            offered: Vec::new(),
            block_size,
            started: false,
            state: ChainState::Open,
            error: None,
            pending_input: false,
            input_ptr: 0,
            passthrough: 0,
            flush_stage: 0,
        }
    }

    /// Appends a driver. Drivers execute strictly in registration order.
    pub fn add(&mut self, filter: Filter) -> &mut FilterChain {
        if self.started {
            panic!("Filters cannot be added once processing has begun");
        }

        self.filters.push(filter);
        self
    }

    /// True when the previous call returned `Flow::Full` and the chain is
    /// waiting for the same input to be offered again.
    #[inline]
    pub fn input_pending(&self) -> bool {
        self.pending_input
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == ChainState::Closed
    }

    /// Runs one input buffer through the chain, appending transformed bytes
    /// to `out`.
    pub fn process(&mut self, input: &Buffer, out: &mut Buffer) -> CoreResult<Flow> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }

        if self.state != ChainState::Open {
            return Err(CoreError::FilterClosed);
        }

        self.prepare();

        if self.pending_input {
            assert_eq!(
                input.bytes().as_ptr() as usize,
                self.input_ptr,
                "Chain must be resumed with the same input buffer"
            );
        } else {
            if input.is_empty() {
                return Ok(Flow::Done);
            }

            self.input_ptr = input.bytes().as_ptr() as usize;
        }

        let result = self.process_inner(input, out);
        let result = self.record(result);

        if let Ok(flow) = &result {
            self.pending_input = *flow == Flow::Full;
        }

        result
    }

    fn process_inner(&mut self, input: &Buffer, out: &mut Buffer) -> CoreResult<Flow> {
        // With no stream stages the chain is a tapped copy: all sinks see
        // the input once, then the bytes move to the output across as many
        // calls as its capacity requires.
        if self.streams.is_empty() {
            if !self.pending_input {
                Self::feed_taps(&mut self.filters, &self.taps[0], input.bytes())?;
            }

            let count = (input.used() - self.passthrough).min(out.remaining());
            out.append(&input.bytes()[self.passthrough..self.passthrough + count]);
            self.passthrough += count;

            if self.passthrough == input.used() {
                self.passthrough = 0;
                return Ok(Flow::Done);
            }

            return Ok(Flow::Full);
        }

        let is_new = !self.pending_input;
        let mut scratch = mem::take(&mut self.scratch);

        let result = Self::drive(
            &mut self.filters,
            &self.streams,
            &self.taps,
            &mut self.offered,
            0,
            &mut scratch,
            Some(input.bytes()),
            is_new,
            out,
            false,
        );

        self.scratch = scratch;
        result
    }

    /// Moves the chain from open to flushing, draining each stage front to
    /// back, and finally to closed. Must be called until `Flow::Done` is
    /// returned.
    pub fn close(&mut self, out: &mut Buffer) -> CoreResult<Flow> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }

        match self.state {
            ChainState::Closed => return Err(CoreError::FilterClosed),
            ChainState::Open => {
                assert!(
                    !self.pending_input,
                    "Chain cannot close while input is pending"
                );

                self.prepare();
                self.state = ChainState::Flushing;
                self.flush_stage = 0;
            }
            ChainState::Flushing => (),
        }

        while self.flush_stage < self.streams.len() {
            let stage = self.flush_stage;
            let mut scratch = mem::take(&mut self.scratch);

            let result = Self::drive(
                &mut self.filters,
                &self.streams,
                &self.taps,
                &mut self.offered,
                stage,
                &mut scratch[stage..],
                None,
                false,
                out,
                true,
            );

            self.scratch = scratch;

            match self.record(result)? {
                Flow::Full => return Ok(Flow::Full),
                Flow::Done => self.flush_stage += 1,
            }
        }

        self.state = ChainState::Closed;
        Ok(Flow::Done)
    }

    /// Returns the result of the first driver whose type tag matches.
    /// Results remain readable after a mid-stream failure, reflecting
    /// whatever the stage observed up to the failure point.
    pub fn result(&self, filter_type: &str) -> CoreResult<Value> {
        assert!(
            self.state == ChainState::Closed,
            "Chain results are only available once the chain is closed"
        );

        for filter in &self.filters {
            if filter.filter_type() == filter_type {
                return filter
                    .result()
                    .ok_or_else(|| CoreError::FilterResultMissing(filter_type.to_string()));
            }
        }

        Err(CoreError::FilterResultMissing(filter_type.to_string()))
    }

    /// All stage results in registration order, for chains that repeat a
    /// driver kind (e.g. a size before and after a transform).
    pub fn result_all(&self) -> Vec<(&'static str, Value)> {
        assert!(
            self.state == ChainState::Closed,
            "Chain results are only available once the chain is closed"
        );

        self.filters
            .iter()
            .filter_map(|filter| filter.result().map(|result| (filter.filter_type(), result)))
            .collect()
    }

    fn prepare(&mut self) {
        if self.started {
            return;
        }

        self.started = true;
        self.taps.push(Vec::new());

        for (idx, filter) in self.filters.iter().enumerate() {
            if filter.is_stream() {
                self.streams.push(idx);
                self.taps.push(Vec::new());
            } else {
                self.taps
                    .last_mut()
                    .expect("Tap group list cannot be empty")
                    .push(idx);
            }
        }

        let stream_total = self.streams.len();

        self.scratch = (0..stream_total.saturating_sub(1))
            .map(|_| Buffer::allocate(self.block_size))
            .collect();
        self.offered = vec![false; stream_total];
    }

    fn record<T>(&mut self, result: CoreResult<T>) -> CoreResult<T> {
        if let Err(err) = &result {
            self.error = Some(err.clone());
            self.state = ChainState::Closed;
        }

        result
    }

    fn feed_taps(filters: &mut [Filter], group: &[usize], chunk: &[u8]) -> CoreResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        for &idx in group {
            if let FilterKind::Sink(driver) = filters[idx].kind_mut() {
                driver.process(chunk)?;
            }
        }

        Ok(())
    }

    fn stream_process(
        filters: &mut [Filter],
        idx: usize,
        input: Option<&[u8]>,
        output: &mut Buffer,
    ) -> CoreResult<()> {
        match filters[idx].kind_mut() {
            FilterKind::Stream(driver) => driver.process(input, output),
            FilterKind::Sink(_) => panic!("Sink filter driven as a stream stage"),
        }
    }

    /// Feeds one chunk (or a flush) into stream stage `j`, draining every
    /// produced chunk through the downstream stages before accepting more.
    /// `scratch` starts at stage `j`'s own downstream buffer. Unwinds with
    /// `Flow::Full` the moment the caller's output fills with work pending;
    /// persistent scratch contents and `offered` flags let the next call
    /// re-enter the paused path.
    #[allow(clippy::too_many_arguments)]
    fn drive(
        filters: &mut Vec<Filter>,
        streams: &[usize],
        taps: &[Vec<usize>],
        offered: &mut [bool],
        j: usize,
        scratch: &mut [Buffer],
        input: Option<&[u8]>,
        is_new: bool,
        out: &mut Buffer,
        flushing: bool,
    ) -> CoreResult<Flow> {
        let stage = streams[j];
        let last = j + 1 == streams.len();

        if is_new {
            if let Some(chunk) = input {
                Self::feed_taps(filters, &taps[j], chunk)?;
            }

            offered[j] = true;
        }

        if last {
            loop {
                let pending = if flushing {
                    filters[stage].stream_input_same() || !filters[stage].stream_done()
                } else {
                    offered[j]
                };

                if !pending {
                    break;
                }

                if out.is_full() {
                    return Ok(Flow::Full);
                }

                let before = out.used();
                Self::stream_process(filters, stage, input, out)?;

                if !filters[stage].stream_input_same() {
                    offered[j] = false;
                }

                let produced = out.used() - before;

                if produced > 0 {
                    let chunk = &out.bytes()[before..];
                    Self::feed_taps(filters, &taps[j + 1], chunk)?;
                } else if !out.is_full() {
                    Self::check_progress(filters, stage, flushing)?;
                }
            }

            return Ok(Flow::Done);
        }

        let (mine, rest) = scratch
            .split_first_mut()
            .expect("Stream stage missing its scratch buffer");

        // A chunk left behind by a paused traversal drains first.
        if mine.used() > 0 {
            match Self::drive(
                filters,
                streams,
                taps,
                offered,
                j + 1,
                &mut *rest,
                Some(mine.bytes()),
                false,
                out,
                false,
            )? {
                Flow::Full => return Ok(Flow::Full),
                Flow::Done => mine.clear(),
            }
        }

        loop {
            let pending = if flushing {
                filters[stage].stream_input_same() || !filters[stage].stream_done()
            } else {
                offered[j]
            };

            if !pending {
                break;
            }

            mine.clear();
            Self::stream_process(filters, stage, input, mine)?;

            if !filters[stage].stream_input_same() {
                offered[j] = false;
            }

            if mine.used() == 0 {
                Self::check_progress(filters, stage, flushing)?;
                continue;
            }

            match Self::drive(
                filters,
                streams,
                taps,
                offered,
                j + 1,
                &mut *rest,
                Some(mine.bytes()),
                true,
                out,
                false,
            )? {
                Flow::Full => return Ok(Flow::Full),
                Flow::Done => mine.clear(),
            }
        }

        Ok(Flow::Done)
    }

    /// A driver that emits nothing into an output with free capacity while
    /// claiming more work is a contract violation; failing here is the only
    /// alternative to spinning forever.
    fn check_progress(filters: &[Filter], stage: usize, flushing: bool) -> CoreResult<()> {
        let stalled = filters[stage].stream_input_same()
            || (flushing && !filters[stage].stream_done());

        if stalled {
            return Err(CoreError::FilterInterface(format!(
                "filter '{}' made no progress",
                filters[stage].filter_type()
            )));
        }

        Ok(())
    }
}
