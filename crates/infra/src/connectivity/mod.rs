//! Connectivity monitors
//!
//! [`HttpConnectivityMonitor`] actively probes an endpoint. Hosts that learn
//! about reachability some other way use
//! [`StaticConnectivity`](tidemark_core::ports::StaticConnectivity).

mod http;

pub use http::{HttpConnectivityMonitor, QualityThresholds};
