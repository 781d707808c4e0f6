//! Simple iSCSI target example with in-memory storage
//!
//! Demonstrates bringing up a target backed by the bundled
//! [`MemoryBackend`].

use iscsi_target::backend::memory::MemoryBackend;
use iscsi_target::IscsiTarget;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let backend = MemoryBackend::new(100 * 1024 * 1024 / 512, 512, 16);

    println!("Creating iSCSI target with 100 MB in-memory storage");

    let target = IscsiTarget::builder()
        .bind_addr("0.0.0.0:3260")
        .target_name("iqn.2025-12.local:storage.memory-disk")
        .build(backend)?;

    println!("\niSCSI target configured:");
    println!("  Target name: iqn.2025-12.local:storage.memory-disk");
    println!("  Listen address: 0.0.0.0:3260");

    target.run()?;
    Ok(())
}
