//! Per-bridge environment

use crate::config::BridgeSettings;
use common::ShutdownSignal;
use std::net::{IpAddr, Ipv4Addr};
use tracing::Span;

/// What a bridge needs from its surroundings
///
/// Passed in at construction so several bridges in one process (or test)
/// stay independent.
#[derive(Debug, Clone)]
pub struct BridgeContext {
    pub settings: BridgeSettings,
    /// Address the TCP listener binds to
    pub bind_addr: IpAddr,
    /// Parent for the bridge's own span
    pub span: Span,
    /// Process-wide stop request; bridges release everything when it fires
    pub shutdown: ShutdownSignal,
}

impl BridgeContext {
    pub fn new(settings: BridgeSettings, bind_addr: IpAddr) -> Self {
        Self {
            settings,
            bind_addr,
            span: Span::current(),
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

impl Default for BridgeContext {
    fn default() -> Self {
        Self::new(
            BridgeSettings::default(),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        )
    }
}
