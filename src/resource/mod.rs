//! Stateful managers of provider-side resources.
//!
//! Every manager tracks the provider handles it created and can force-release all of them,
//! this is what the bridge lifecycle relies on to leave no breakpoint, watch or scan result
//! registered with the host across restarts.

pub mod breakpoint;
pub mod scan;
pub mod watch;

pub use breakpoint::{
    BreakpointError, BreakpointHit, BreakpointKind, BreakpointManager, BreakpointRecord,
    CaptureOptions,
};
pub use scan::{ScanError, ScanManager, ScanPage};
pub use watch::{WatchError, WatchManager, WatchPoll, WatchStarted, WatchStopped};
