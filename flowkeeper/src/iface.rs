//! Interface discovery and capture lifecycle.
//!
//! [`source::InterfaceSource`] turns interface enumeration (watched through
//! netlink or polled) into `Added`/`Removed` events for the interfaces the
//! [`selector::InterfaceSelector`] admits. [`controller::IfaceController`]
//! consumes those events and attaches or detaches the external capture.

pub mod agent_ip;
pub mod controller;
pub mod lister;
pub mod netlink_monitor;
pub mod selector;
pub mod source;
pub mod types;

pub use types::{IfaceEvent, InterfaceInfo};
