//! Round-trips a 64 KiB storage buffer through the transfer manager on a
//! real GPU, with unrelated transfers in between.

use anyhow::{ensure, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vkk_engine::{Buffer, BufferUsage, EngineBuilder, EngineConfig, UpdateMode, XferMode};

const WORDS: usize = 16 * 1024;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let validation = std::env::args().any(|arg| arg == "--validation");
    let engine = EngineBuilder::new()
        .config(EngineConfig::new("vkk-xfer-demo").with_validation(validation))
        .build()
        .context("failed to create engine")?;

    let pattern: Vec<u32> = (0..WORDS as u32).collect();
    let bytes = (WORDS * 4) as u64;
    let target = Buffer::new(
        &engine,
        UpdateMode::Synchronous,
        BufferUsage::Storage,
        bytes,
        None,
    )?;
    let scratch = Buffer::new(
        &engine,
        UpdateMode::Synchronous,
        BufferUsage::Storage,
        4096,
        None,
    )?;

    let expected: &[u8] = bytemuck::cast_slice(&pattern);
    let transfer = engine.transfer();
    transfer.blit_storage(XferMode::Write(expected), &target, 0)?;

    // Unrelated transfers of a different size class.
    transfer.blit_storage(XferMode::WriteAsync(&[0xAB; 4096]), &scratch, 0)?;
    let mut small = vec![0u8; 4096];
    transfer.blit_storage(XferMode::Read(&mut small), &scratch, 0)?;
    ensure!(small.iter().all(|&b| b == 0xAB), "scratch buffer mismatch");

    let mut readback = vec![0u8; bytes as usize];
    transfer.blit_storage(XferMode::Read(&mut readback), &target, 0)?;
    ensure!(readback == expected, "64 KiB round trip mismatch");
    info!("64 KiB round trip matches");

    engine.log_info();
    drop((target, scratch));
    engine.wait_deletions();
    engine.shutdown();
    Ok(())
}
