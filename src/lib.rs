//! Workspace placeholder crate.
//!
//! Exposes feature flags that map to the individual workspace crates.
//! `desktop-shims` (default) pulls in `core-service` with the S3, Zabbix and
//! `tsm` adapters wired; `engine-only` exposes the engines without any
//! concrete adapter so a host can inject its own bridges.

#[cfg(feature = "desktop-shims")]
pub use core_service::*;

#[cfg(feature = "engine-only")]
pub use core_fullbackup;
#[cfg(feature = "engine-only")]
pub use core_sync;
