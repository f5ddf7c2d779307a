use std::sync::{Arc, Mutex};

use pnet::datalink;

use crate::iface::types::InterfaceInfo;

/// Enumerates the interfaces currently present on the host.
pub trait InterfaceLister: Send + Sync {
    fn list(&self) -> Vec<InterfaceInfo>;
}

/// Reads the interface table through pnet (`getifaddrs` on Linux).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLister;

impl InterfaceLister for SystemLister {
    fn list(&self) -> Vec<InterfaceInfo> {
        datalink::interfaces()
            .into_iter()
            .map(|iface| InterfaceInfo {
                index: iface.index,
                up: iface.is_up(),
                addrs: iface.ips.iter().map(|net| net.ip()).collect(),
                name: iface.name,
            })
            .collect()
    }
}

/// A lister whose contents are set by hand. Cloning shares the contents.
#[derive(Debug, Default, Clone)]
pub struct StaticLister {
    interfaces: Arc<Mutex<Vec<InterfaceInfo>>>,
}

impl StaticLister {
    pub fn new(interfaces: Vec<InterfaceInfo>) -> Self {
        Self {
            interfaces: Arc::new(Mutex::new(interfaces)),
        }
    }

    pub fn set(&self, interfaces: Vec<InterfaceInfo>) {
        *self.interfaces.lock().unwrap_or_else(|e| e.into_inner()) = interfaces;
    }
}

impl InterfaceLister for StaticLister {
    fn list(&self) -> Vec<InterfaceInfo> {
        self.interfaces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
