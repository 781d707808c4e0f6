//! A pure Rust iSCSI target implementation
//!
//! This library provides a reusable iSCSI target server that can be integrated
//! into storage applications. Users implement the `Backend` trait to
//! provide the actual storage backend, or use one of the bundled ones
//! ([`backend::file::FileBackend`], [`backend::memory::MemoryBackend`],
//! [`backend::nbd::NbdBackend`]).
//!
//! # Example
//!
//! ```no_run
//! use iscsi_target::{IscsiTarget, ScsiResult};
//! use iscsi_target::backend::memory::MemoryBackend;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = MemoryBackend::new(2048, 512, 128);
//! let target = IscsiTarget::builder()
//!     .bind_addr("0.0.0.0:3260")
//!     .target_name("iqn.2026-01.local:storage.disk1")
//!     .build(backend)?;
//! target.run()?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backend;
pub mod client;
pub mod config;
pub mod crc32c;
pub mod error;
pub mod pdu;
pub mod scsi;
pub mod session;
pub mod stats;
pub mod target;

pub use auth::AuthConfig;
pub use backend::Backend;
pub use client::IscsiClient;
pub use config::TargetConfig;
pub use error::{IscsiError, ScsiResult};
pub use target::{IscsiTarget, IscsiTargetBuilder};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
