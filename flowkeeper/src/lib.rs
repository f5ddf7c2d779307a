//! Node-resident flow accounting: interface tracking, deduplication, a bounded
//! flow cache and batched export.

pub mod cache;
pub mod capture;
pub mod dedup;
pub mod error;
pub mod exporters;
pub mod filter;
pub mod iface;
pub mod ip;
pub mod metrics;
pub mod pipeline;
pub mod runtime;

pub use error::FlowkeeperError;
