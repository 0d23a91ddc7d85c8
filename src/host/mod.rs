//! Introspection hosts shipped with the bridge.

pub mod disasm;
pub mod procfs;
pub mod sim;

use crate::provider::{IntrospectionProvider, ProviderError};
use clap::ValueEnum;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum HostKind {
    /// Deterministic in-memory target.
    Sim,
    /// Live Linux process, read-only.
    Procfs,
}

/// Create the provider of a host.
pub fn open(kind: HostKind, pid: Option<i32>) -> Result<Box<dyn IntrospectionProvider>, ProviderError> {
    match kind {
        HostKind::Sim => Ok(Box::new(sim::SimulatedProvider::default_target())),
        HostKind::Procfs => {
            let pid = pid.ok_or(ProviderError::Unsupported("procfs host without a pid"))?;
            Ok(Box::new(procfs::ProcfsProvider::attach(pid)?))
        }
    }
}
