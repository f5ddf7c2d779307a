//! Interface snapshots and the lifecycle events derived from them.

use std::{fmt, net::IpAddr};

/// One network interface as seen at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub index: u32,
    pub name: String,
    pub addrs: Vec<IpAddr>,
    pub up: bool,
}

impl InterfaceInfo {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            addrs: Vec::new(),
            up: true,
        }
    }

    pub fn with_addrs(mut self, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        self.addrs = addrs.into_iter().collect();
        self
    }

    pub fn down(mut self) -> Self {
        self.up = false;
        self
    }
}

impl fmt::Display for InterfaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfaceEvent {
    Added(InterfaceInfo),
    Removed(InterfaceInfo),
}

impl IfaceEvent {
    pub fn info(&self) -> &InterfaceInfo {
        match self {
            IfaceEvent::Added(info) | IfaceEvent::Removed(info) => info,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IfaceEvent::Added(_) => "added",
            IfaceEvent::Removed(_) => "removed",
        }
    }
}

impl fmt::Display for IfaceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.info())
    }
}
