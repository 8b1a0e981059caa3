//! Sample processing pipeline.
//!
//! ```text
//! FilterInput ─▶ MotionFilter (per device, ticking) ─▶ FilterStream ─┐
//! FilterInput ─▶ MotionFilter (per device, ticking) ─▶ FilterStream ─┼─▶ FilterOrchestrator ─▶ consumer
//! FilterInput ─▶ MotionFilter (per device, ticking) ─▶ FilterStream ─┘
//! ```

pub mod filter;
pub mod leaky;
pub mod orchestrator;

pub use filter::{
    run_filter, FilterInput, FilterOutput, FilterSettings, FilterStream, MagnitudeFilter,
    MotionFilter,
};
pub use leaky::{LeakyIntegratorFilter, LeakySettings};
pub use orchestrator::{FilterOrchestrator, FilteredValueConsumer};

/// Recipe for the filter each new device gets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterBlueprint {
    /// Sliding-window magnitude mean
    Magnitude(FilterSettings),
    /// Decaying trigger envelope
    LeakyIntegrator(LeakySettings),
}

impl FilterBlueprint {
    /// Build a fresh filter instance.
    pub fn build(&self) -> Box<dyn MotionFilter> {
        match *self {
            FilterBlueprint::Magnitude(settings) => Box::new(MagnitudeFilter::new(settings)),
            FilterBlueprint::LeakyIntegrator(settings) => {
                Box::new(LeakyIntegratorFilter::new(settings))
            }
        }
    }
}

impl Default for FilterBlueprint {
    fn default() -> Self {
        FilterBlueprint::Magnitude(FilterSettings::default())
    }
}
