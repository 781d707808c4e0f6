//! Example demonstrating graceful shutdown: the target stops accepting new
//! logins while letting already-established connections finish, before the
//! accept loop itself is torn down.

use iscsi_target::backend::memory::MemoryBackend;
use iscsi_target::IscsiTarget;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:3261".to_string());

    println!("Graceful shutdown example");
    println!("1. Target starts and accepts connections");
    println!("2. shutdown_gracefully() is called: existing connections keep");
    println!("   running, new logins are rejected with SERVICE_UNAVAILABLE");
    println!("3. stop() then tears down the accept loop and run() returns");
    println!();

    let backend = MemoryBackend::new(100 * 1024 * 1024 / 512, 512, 16);
    let target = IscsiTarget::builder()
        .bind_addr(&bind_addr)
        .target_name("iqn.2025-12.local:storage.graceful-shutdown-demo")
        .build(backend)?;

    println!("iSCSI target configured:");
    println!("  Target name: iqn.2025-12.local:storage.graceful-shutdown-demo");
    println!("  Listen address: {}", bind_addr);
    println!();

    let target = Arc::new(target);
    let target_clone = Arc::clone(&target);

    let target_thread = thread::spawn(move || target_clone.run());

    thread::sleep(Duration::from_secs(1));
    println!("Target is running and accepting connections.");

    println!("Waiting 5 seconds before draining...");
    thread::sleep(Duration::from_secs(5));

    println!("Draining: rejecting new logins, existing sessions keep running...");
    target.shutdown_gracefully();

    println!("Active connections: {}", target.active_connection_count());
    thread::sleep(Duration::from_secs(2));

    println!("Stopping target...");
    target.stop();

    let _ = target_thread.join();
    println!("Target shut down cleanly");

    Ok(())
}
