//! Lazy pull streams
//!
//! Every step produces an `ExecutionStream`: a single-consumer iterator over
//! rows with an explicit `close`. Closing is idempotent and must reach every
//! source stream a composed stream opened, including on early termination.

use crate::context::CommandContext;
use crate::result::Row;
use crate::step::StepStats;
use std::time::Instant;
use tessera_core::{Error, Result};

/// Pull iterator over rows
pub trait ExecutionStream {
    /// Whether another row is available
    fn has_next(&mut self, ctx: &mut CommandContext<'_>) -> Result<bool>;

    /// The next row. Fails with `IllegalState` unless the preceding
    /// `has_next` returned true.
    fn next(&mut self, ctx: &mut CommandContext<'_>) -> Result<Row>;

    /// Release the stream and every source it opened. Calling it again is a no-op.
    fn close(&mut self, ctx: &mut CommandContext<'_>);
}

pub type BoxStream = Box<dyn ExecutionStream>;

/// Row-at-a-time generator turned into a stream by [`LazyStream`]
pub trait RowProducer {
    /// Produce the next row, or `None` when exhausted
    fn produce(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<Row>>;

    /// Close upstream streams and release resources
    fn release(&mut self, _ctx: &mut CommandContext<'_>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Exhausted,
    Closed,
}

/// Stream over a producer with a one-row lookahead
pub struct LazyStream<P> {
    producer: P,
    peeked: Option<Row>,
    state: StreamState,
}

impl<P: RowProducer> LazyStream<P> {
    pub fn new(producer: P) -> Self {
        Self {
            producer,
            peeked: None,
            state: StreamState::Open,
        }
    }
}

impl<P: RowProducer> ExecutionStream for LazyStream<P> {
    fn has_next(&mut self, ctx: &mut CommandContext<'_>) -> Result<bool> {
        if self.peeked.is_some() {
            return Ok(true);
        }
        if self.state != StreamState::Open {
            return Ok(false);
        }
        match self.producer.produce(ctx)? {
            Some(row) => {
                self.peeked = Some(row);
                Ok(true)
            }
            None => {
                self.state = StreamState::Exhausted;
                Ok(false)
            }
        }
    }

    fn next(&mut self, _ctx: &mut CommandContext<'_>) -> Result<Row> {
        if self.state == StreamState::Closed {
            return Err(Error::IllegalState("Stream is closed".to_string()));
        }
        self.peeked
            .take()
            .ok_or_else(|| Error::IllegalState("next() called without a row available".to_string()))
    }

    fn close(&mut self, ctx: &mut CommandContext<'_>) {
        if self.state == StreamState::Closed {
            return;
        }
        self.state = StreamState::Closed;
        self.peeked = None;
        self.producer.release(ctx);
    }
}

/// Box a producer as a stream
pub fn from_producer<P: RowProducer + 'static>(producer: P) -> BoxStream {
    Box::new(LazyStream::new(producer))
}

struct RowsProducer {
    rows: std::vec::IntoIter<Row>,
}

impl RowProducer for RowsProducer {
    fn produce(&mut self, _ctx: &mut CommandContext<'_>) -> Result<Option<Row>> {
        Ok(self.rows.next())
    }
}

/// Stream over rows already in memory
pub fn from_rows<I: IntoIterator<Item = Row>>(rows: I) -> BoxStream {
    from_producer(RowsProducer {
        rows: rows.into_iter().collect::<Vec<_>>().into_iter(),
    })
}

pub fn empty() -> BoxStream {
    from_rows(Vec::new())
}

fn pull_into(stream: &mut BoxStream, ctx: &mut CommandContext<'_>, rows: &mut Vec<Row>) -> Result<()> {
    while stream.has_next(ctx)? {
        rows.push(stream.next(ctx)?);
    }
    Ok(())
}

/// Pull every row, then close. The stream is closed on error too.
pub fn drain(mut stream: BoxStream, ctx: &mut CommandContext<'_>) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    let result = pull_into(&mut stream, ctx, &mut rows);
    stream.close(ctx);
    result.map(|_| rows)
}

fn pull_count(stream: &mut BoxStream, ctx: &mut CommandContext<'_>) -> Result<u64> {
    let mut count = 0;
    while stream.has_next(ctx)? {
        stream.next(ctx)?;
        count += 1;
    }
    Ok(count)
}

/// Run a stream to completion for its side effects
pub fn consume(mut stream: BoxStream, ctx: &mut CommandContext<'_>) -> Result<u64> {
    let result = pull_count(&mut stream, ctx);
    stream.close(ctx);
    result
}

// ========== Combinators ==========

struct MapProducer<F> {
    upstream: BoxStream,
    f: F,
}

impl<F> RowProducer for MapProducer<F>
where
    F: FnMut(Row, &mut CommandContext<'_>) -> Result<Row>,
{
    fn produce(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<Row>> {
        if !self.upstream.has_next(ctx)? {
            return Ok(None);
        }
        let row = self.upstream.next(ctx)?;
        (self.f)(row, ctx).map(Some)
    }

    fn release(&mut self, ctx: &mut CommandContext<'_>) {
        self.upstream.close(ctx);
    }
}

struct FilterProducer<F> {
    upstream: BoxStream,
    f: F,
}

impl<F> RowProducer for FilterProducer<F>
where
    F: FnMut(Row, &mut CommandContext<'_>) -> Result<Option<Row>>,
{
    fn produce(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<Row>> {
        while self.upstream.has_next(ctx)? {
            let row = self.upstream.next(ctx)?;
            if let Some(row) = (self.f)(row, ctx)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn release(&mut self, ctx: &mut CommandContext<'_>) {
        self.upstream.close(ctx);
    }
}

struct FlatMapProducer<F> {
    upstream: BoxStream,
    f: F,
    current: Option<BoxStream>,
}

impl<F> RowProducer for FlatMapProducer<F>
where
    F: FnMut(Row, &mut CommandContext<'_>) -> Result<BoxStream>,
{
    fn produce(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<Row>> {
        loop {
            if let Some(current) = self.current.as_mut() {
                if current.has_next(ctx)? {
                    return current.next(ctx).map(Some);
                }
                current.close(ctx);
                self.current = None;
            }
            if !self.upstream.has_next(ctx)? {
                return Ok(None);
            }
            let row = self.upstream.next(ctx)?;
            self.current = Some((self.f)(row, ctx)?);
        }
    }

    fn release(&mut self, ctx: &mut CommandContext<'_>) {
        if let Some(mut current) = self.current.take() {
            current.close(ctx);
        }
        self.upstream.close(ctx);
    }
}

struct LimitProducer {
    upstream: BoxStream,
    remaining: usize,
    upstream_closed: bool,
}

impl LimitProducer {
    fn close_upstream(&mut self, ctx: &mut CommandContext<'_>) {
        if !self.upstream_closed {
            self.upstream_closed = true;
            self.upstream.close(ctx);
        }
    }
}

impl RowProducer for LimitProducer {
    fn produce(&mut self, ctx: &mut CommandContext<'_>) -> Result<Option<Row>> {
        if self.remaining == 0 {
            self.close_upstream(ctx);
            return Ok(None);
        }
        if !self.upstream.has_next(ctx)? {
            return Ok(None);
        }
        self.remaining -= 1;
        self.upstream.next(ctx).map(Some)
    }

    fn release(&mut self, ctx: &mut CommandContext<'_>) {
        self.close_upstream(ctx);
    }
}

/// Records time spent and rows produced without altering the stream
struct ProfiledStream {
    inner: BoxStream,
    stats: StepStats,
}

impl ExecutionStream for ProfiledStream {
    fn has_next(&mut self, ctx: &mut CommandContext<'_>) -> Result<bool> {
        let start = Instant::now();
        let result = self.inner.has_next(ctx);
        self.stats.add_elapsed(start.elapsed());
        result
    }

    fn next(&mut self, ctx: &mut CommandContext<'_>) -> Result<Row> {
        let start = Instant::now();
        let result = self.inner.next(ctx);
        self.stats.add_elapsed(start.elapsed());
        if result.is_ok() {
            self.stats.add_row();
        }
        result
    }

    fn close(&mut self, ctx: &mut CommandContext<'_>) {
        self.inner.close(ctx);
    }
}

/// Combinators over boxed streams
pub trait StreamExt {
    /// Transform each row
    fn map_rows<F>(self, f: F) -> BoxStream
    where
        F: FnMut(Row, &mut CommandContext<'_>) -> Result<Row> + 'static;

    /// Keep rows for which `f` returns a value
    fn filter_rows<F>(self, f: F) -> BoxStream
    where
        F: FnMut(Row, &mut CommandContext<'_>) -> Result<Option<Row>> + 'static;

    /// Replace each row by a sub-stream, closed once drained
    fn flat_map_rows<F>(self, f: F) -> BoxStream
    where
        F: FnMut(Row, &mut CommandContext<'_>) -> Result<BoxStream> + 'static;

    /// Stop after `n` rows and close upstream
    fn limit(self, n: usize) -> BoxStream;

    fn profiled(self, stats: StepStats) -> BoxStream;
}

impl StreamExt for BoxStream {
    fn map_rows<F>(self, f: F) -> BoxStream
    where
        F: FnMut(Row, &mut CommandContext<'_>) -> Result<Row> + 'static,
    {
        from_producer(MapProducer { upstream: self, f })
    }

    fn filter_rows<F>(self, f: F) -> BoxStream
    where
        F: FnMut(Row, &mut CommandContext<'_>) -> Result<Option<Row>> + 'static,
    {
        from_producer(FilterProducer { upstream: self, f })
    }

    fn flat_map_rows<F>(self, f: F) -> BoxStream
    where
        F: FnMut(Row, &mut CommandContext<'_>) -> Result<BoxStream> + 'static,
    {
        from_producer(FlatMapProducer {
            upstream: self,
            f,
            current: None,
        })
    }

    fn limit(self, n: usize) -> BoxStream {
        from_producer(LimitProducer {
            upstream: self,
            remaining: n,
            upstream_closed: false,
        })
    }

    fn profiled(self, stats: StepStats) -> BoxStream {
        stats.mark_profiled();
        Box::new(ProfiledStream { inner: self, stats })
    }
}
