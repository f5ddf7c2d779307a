//! Seam to the external capture mechanism.
//!
//! The pipeline never touches packets itself. It asks a [`Capture`]
//! implementation to hook or unhook an interface and receives the resulting
//! [`flowkeeper_common::RawEvent`]s through [`crate::pipeline::Ingest`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{iface::InterfaceInfo, runtime::conf::Conf};

pub mod socket;

/// What the capture side should hook and which optional fields it should fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureOptions {
    pub ingress: bool,
    pub egress: bool,
    pub rtt: bool,
    pub drops: bool,
    pub dns: bool,
    pub dns_port: u16,
    pub translation: bool,
}

impl CaptureOptions {
    pub fn from_conf(conf: &Conf) -> Self {
        Self {
            ingress: conf.direction.ingress(),
            egress: conf.direction.egress(),
            rtt: conf.enable_rtt,
            drops: conf.enable_pkt_drops,
            dns: conf.enable_dns_tracking,
            dns_port: conf.dns_tracking_port,
            translation: conf.enable_pkt_translation,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("interface {0} is already attached")]
    AlreadyAttached(String),

    #[error("interface {0} is not attached")]
    NotAttached(String),

    #[error("capture backend is unavailable: {0}")]
    Unavailable(String),

    #[error("capture io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Capture: Send + Sync {
    async fn attach(&self, iface: &InterfaceInfo, opts: &CaptureOptions)
    -> Result<(), CaptureError>;

    async fn detach(&self, iface: &InterfaceInfo) -> Result<(), CaptureError>;
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::conf::DirectionMode;

    #[test]
    fn options_follow_conf() {
        let conf = Conf {
            direction: DirectionMode::Egress,
            enable_dns_tracking: true,
            dns_tracking_port: 5353,
            ..Default::default()
        };
        let opts = CaptureOptions::from_conf(&conf);
        assert!(!opts.ingress);
        assert!(opts.egress);
        assert!(opts.dns);
        assert_eq!(opts.dns_port, 5353);
        assert!(!opts.rtt);
    }
}
