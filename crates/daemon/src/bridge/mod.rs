//! Per-device USB to TCP bridge
//!
//! - [`Bridge`]: lifecycle of one device on one port, driven by a serialized
//!   operation queue
//! - [`RouterHandle`]: the single-client TCP side of an online bridge

pub mod context;
pub mod machine;
pub mod ops;
pub mod router;
pub mod state;

pub use context::BridgeContext;
pub use machine::Bridge;
pub use ops::BridgeOp;
pub use router::RouterHandle;
pub use state::BridgeState;
