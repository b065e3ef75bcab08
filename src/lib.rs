//! Offline-first cache for location-scoped content.
//!
//! Records live in a local SQLite store and are reconciled with a remote
//! content API in the background. Reads and writes go through the
//! [`CacheFacade`](facade::CacheFacade) and never wait for the network;
//! the [`SyncCoordinator`](sync::SyncCoordinator) pulls regions, pushes local
//! changes and resolves conflicts, and every committed change is announced
//! on the [`ChangeBus`](bus::ChangeBus).

pub mod bus;
pub mod config;
pub mod engine;
pub mod facade;
pub mod location;
pub mod remote;
pub mod store;
pub mod sync;

pub use engine::Engine;
