//! cebridge: command-and-control bridge for a memory-introspection host.
//!
//! Requests arrive as length-prefixed JSON frames ([`transport`], [`protocol`]), are executed
//! one at a time on the thread owning the host ([`exchange`], [`bridge`]) and are routed by
//! method name to handlers ([`dispatch`]) that drive the host through the
//! [`provider::IntrospectionProvider`] interface and the resource managers in [`resource`].

pub mod address;
pub mod bridge;
pub mod config;
pub mod dispatch;
mod error;
pub mod exchange;
pub mod host;
pub mod log;
pub mod protocol;
pub mod provider;
pub mod resource;
pub mod transport;
