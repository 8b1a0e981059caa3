//! Per-device motion filters.
//!
//! A filter turns an irregular, possibly gappy stream of [`AccelerometerSample`]s into a
//! regular stream of [`FilterOutput`]s. Emission is strictly time driven: ingesting a
//! sample never blocks and never produces output by itself.
//!
//! # Running a filter
//!
//! [`run_filter`] splits a filter into two halves:
//!
//! - [`FilterInput`]: cheap to clone, handed to the connection manager as its sample
//!   sink. Samples travel over an unbounded channel, so per-device arrival order is
//!   preserved.
//! - [`FilterStream`]: a lazy, infinite stream. Each poll that finds no pending tick
//!   starts a fresh `update_period` timer; when it fires, queued samples are drained
//!   into the filter and one output is produced. The stream ends only after
//!   [`FilterStream::close`]. A close that races a due tick wins.
//!
//! ```rust,ignore
//! let (input, mut outputs) = run_filter(MagnitudeFilter::new(FilterSettings::default()));
//! input.on_accelerometer_data(sample);
//! let first = outputs.next().await; // ~50 ms later
//! outputs.close();
//! ```

use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::connection::SampleSink;
use crate::hardware::protocol::AccelerometerSample;

/// One filtered value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterOutput {
    /// Filtered value
    pub value: f64,
    /// Tick time that produced it
    pub timestamp: Instant,
}

/// Timing parameters of a [`MagnitudeFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSettings {
    /// Tick interval.
    pub update_period: Duration,
    /// Retention horizon of the sample buffer.
    pub window_size: Duration,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            update_period: Duration::from_millis(50),
            window_size: Duration::from_millis(500),
        }
    }
}

/// Behaviour shared by every per-device filter.
///
/// Implementations are plain synchronous state machines; all timing lives in
/// [`run_filter`].
pub trait MotionFilter: Send + 'static {
    /// Buffer one sample. Must not block.
    fn on_accelerometer_data(&mut self, sample: AccelerometerSample);

    /// Produce the output for the tick at `now`.
    fn tick(&mut self, now: Instant) -> FilterOutput;

    /// Interval between ticks.
    fn update_period(&self) -> Duration;
}

impl MotionFilter for Box<dyn MotionFilter> {
    fn on_accelerometer_data(&mut self, sample: AccelerometerSample) {
        (**self).on_accelerometer_data(sample);
    }

    fn tick(&mut self, now: Instant) -> FilterOutput {
        (**self).tick(now)
    }

    fn update_period(&self) -> Duration {
        (**self).update_period()
    }
}

/// Sliding-window mean of the acceleration magnitude.
///
/// On every tick, samples older than `now - window_size` are trimmed from the front
/// of the buffer and the mean of `sqrt(x² + y² + z²)` over the rest is emitted.
/// An empty window yields `0.0`.
#[derive(Debug)]
pub struct MagnitudeFilter {
    settings: FilterSettings,
    buffer: VecDeque<AccelerometerSample>,
}

impl MagnitudeFilter {
    /// Empty filter.
    pub fn new(settings: FilterSettings) -> Self {
        Self {
            settings,
            buffer: VecDeque::new(),
        }
    }

    /// Takes effect from the next tick.
    pub fn set_update_period(&mut self, update_period: Duration) {
        self.settings.update_period = update_period;
    }

    /// Takes effect from the next tick.
    pub fn set_window_size(&mut self, window_size: Duration) {
        self.settings.window_size = window_size;
    }

    /// Current timing parameters.
    #[must_use]
    pub fn settings(&self) -> FilterSettings {
        self.settings
    }

    /// Samples currently retained.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn trim(&mut self, now: Instant) {
        // buffer is time ordered, so expiry is always a prefix
        while let Some(front) = self.buffer.front() {
            if now.saturating_duration_since(front.timestamp) > self.settings.window_size {
                self.buffer.pop_front();
            } else {
                break;
            }
        }
    }
}

impl MotionFilter for MagnitudeFilter {
    fn on_accelerometer_data(&mut self, sample: AccelerometerSample) {
        self.buffer.push_back(sample);
    }

    fn tick(&mut self, now: Instant) -> FilterOutput {
        self.trim(now);

        let value = if self.buffer.is_empty() {
            0.0
        } else {
            let sum: f64 = self.buffer.iter().map(AccelerometerSample::magnitude).sum();
            sum / self.buffer.len() as f64
        };

        FilterOutput {
            value,
            timestamp: now,
        }
    }

    fn update_period(&self) -> Duration {
        self.settings.update_period
    }
}

/// Non-blocking ingestion handle for a running filter.
#[derive(Debug, Clone)]
pub struct FilterInput {
    tx: mpsc::UnboundedSender<AccelerometerSample>,
}

impl FilterInput {
    /// Queue a sample for the next tick. Returns `false` once the filter has stopped.
    pub fn on_accelerometer_data(&self, sample: AccelerometerSample) -> bool {
        self.tx.send(sample).is_ok()
    }

    /// Whether the filter behind this handle has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl SampleSink for FilterInput {
    fn on_sample(&self, sample: AccelerometerSample) {
        if !self.on_accelerometer_data(sample) {
            tracing::trace!("Dropping sample for stopped filter");
        }
    }
}

/// The output sequence of one filter.
///
/// Any stream of [`FilterOutput`] can be wrapped with [`FilterStream::new`]; the
/// orchestrator only relies on this type's stream behaviour and its stop token.
pub struct FilterStream {
    inner: BoxStream<'static, FilterOutput>,
    stop: CancellationToken,
}

impl FilterStream {
    /// Wrap an output stream that terminates once `stop` is cancelled.
    pub fn new(inner: BoxStream<'static, FilterOutput>, stop: CancellationToken) -> Self {
        Self { inner, stop }
    }

    /// Ask the sequence to end. A tick that has not fired yet is abandoned.
    pub fn close(&self) {
        self.stop.cancel();
    }

    /// Whether `close` was called or the stop token fired.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Token that closes this stream when cancelled.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

impl Stream for FilterStream {
    type Item = FilterOutput;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for FilterStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterStream")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

struct RunState<F> {
    filter: F,
    input: mpsc::UnboundedReceiver<AccelerometerSample>,
    stop: CancellationToken,
}

/// Start a filter: returns its ingestion handle and its lazy output stream.
pub fn run_filter<F: MotionFilter>(filter: F) -> (FilterInput, FilterStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stop = CancellationToken::new();
    let state = RunState {
        filter,
        input: rx,
        stop: stop.clone(),
    };

    let outputs = stream::unfold(state, |mut state| async move {
        let period = state.filter.update_period();
        let stopped = tokio::select! {
            biased;
            _ = state.stop.cancelled() => true,
            _ = tokio::time::sleep(period) => false,
        };
        if stopped {
            return None;
        }

        while let Ok(sample) = state.input.try_recv() {
            state.filter.on_accelerometer_data(sample);
        }
        let output = state.filter.tick(Instant::now());
        Some((output, state))
    })
    .fuse()
    .boxed();

    (FilterInput { tx }, FilterStream::new(outputs, stop))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at(base: Instant, offset_ms: u64, x: i16, y: i16, z: i16) -> AccelerometerSample {
        AccelerometerSample {
            x,
            y,
            z,
            timestamp: base + Duration::from_millis(offset_ms),
        }
    }

    #[test]
    fn window_trims_expired_prefix() {
        let base = Instant::now();
        let mut filter = MagnitudeFilter::new(FilterSettings {
            update_period: Duration::from_millis(50),
            window_size: Duration::from_millis(300),
        });

        // magnitudes 100, 200, ..., 600 at t = 0, 100, ..., 500 ms
        for i in 0..6u64 {
            filter.on_accelerometer_data(sample_at(base, i * 100, 0, 0, (i as i16 + 1) * 100));
        }

        let output = filter.tick(base + Duration::from_millis(500));
        // only t >= 200 ms remain: 300, 400, 500, 600
        assert_eq!(filter.buffered(), 4);
        assert!((output.value - 450.0).abs() < 1e-9);
        assert_eq!(output.timestamp, base + Duration::from_millis(500));
    }

    #[test]
    fn empty_window_is_zero() {
        let mut filter = MagnitudeFilter::new(FilterSettings::default());
        let now = Instant::now();
        assert_eq!(filter.tick(now).value, 0.0);
        assert_eq!(filter.tick(now + Duration::from_secs(1)).value, 0.0);
    }

    #[test]
    fn all_samples_expire() {
        let base = Instant::now();
        let mut filter = MagnitudeFilter::new(FilterSettings::default());
        filter.on_accelerometer_data(sample_at(base, 0, 3, 4, 0));
        assert!((filter.tick(base).value - 5.0).abs() < 1e-9);
        assert_eq!(filter.tick(base + Duration::from_secs(2)).value, 0.0);
        assert_eq!(filter.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_ticks_on_period_and_drains_input() {
        let settings = FilterSettings {
            update_period: Duration::from_millis(50),
            window_size: Duration::from_millis(500),
        };
        let (input, mut outputs) = run_filter(MagnitudeFilter::new(settings));

        let start = Instant::now();
        input.on_accelerometer_data(AccelerometerSample {
            x: 0,
            y: 0,
            z: 1000,
            timestamp: start,
        });

        let first = outputs.next().await.unwrap();
        assert_eq!(first.timestamp - start, Duration::from_millis(50));
        assert!((first.value - 1000.0).abs() < 1e-9);

        let second = outputs.next().await.unwrap();
        assert_eq!(second.timestamp - first.timestamp, Duration::from_millis(50));

        outputs.close();
        assert!(outputs.next().await.is_none());
        // fused: polling again is fine
        assert!(outputs.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ingest_does_not_trigger_emission() {
        let (input, mut outputs) = run_filter(MagnitudeFilter::new(FilterSettings::default()));
        let start = Instant::now();
        for i in 0..100 {
            input.on_accelerometer_data(AccelerometerSample {
                x: i,
                y: 0,
                z: 0,
                timestamp: start,
            });
        }
        let first = outputs.next().await.unwrap();
        assert_eq!(first.timestamp - start, Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn close_wins_over_due_tick() {
        use futures::FutureExt;

        let (_input, mut outputs) = run_filter(MagnitudeFilter::new(FilterSettings::default()));
        // first poll arms the tick timer
        assert!(outputs.next().now_or_never().is_none());

        // the tick is now due and the stop arrives alongside it
        tokio::time::advance(Duration::from_millis(60)).await;
        outputs.close();
        assert!(outputs.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn input_reports_closed_after_stream_dropped() {
        let (input, outputs) = run_filter(MagnitudeFilter::new(FilterSettings::default()));
        assert!(!input.is_closed());
        drop(outputs);
        assert!(input.is_closed());
        assert!(!input.on_accelerometer_data(AccelerometerSample {
            x: 0,
            y: 0,
            z: 0,
            timestamp: Instant::now(),
        }));
    }
}
