//! # SafeSync Core
//!
//! The local side of SafeSync: a registry of named encrypted databases and the
//! in-memory models of the ones currently unlocked.
//!
//! This crate provides:
//! - [`DatabaseRegistry`] - friendly name → backing file mapping, open/close,
//!   create, import, rename, duplicate and remove
//! - [`DatabaseModel`] - an unlocked database with write-through edits
//! - [`ModelLease`] - exclusive right to replace a model's contents during sync
//! - [`EventFeed`] - typed change notifications for observers

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod events;
mod model;
mod registry;

pub use config::RegistryConfig;
pub use error::{CoreError, CoreResult};
pub use events::{EventFeed, EventListener, ListenerId, RegistryEvent};
pub use model::{DatabaseModel, ModelLease};
pub use registry::{DatabaseRegistry, DATABASES_NAMESPACE};
