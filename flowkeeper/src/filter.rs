//! Flow filtering applied to raw events before they enter the pipeline.
//!
//! Rules are compiled once at startup into [`rules::FlowFilter`]; the global
//! pre-filter sampler lives in [`sampling`].

pub mod opts;
pub mod rules;
pub mod sampling;

pub use opts::{FilterAction, FlowFilterRule};
pub use rules::{FilterError, FlowFilter, Verdict};
pub use sampling::EveryNth;
