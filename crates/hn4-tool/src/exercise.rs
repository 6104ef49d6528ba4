use anyhow::{ensure, Context, Result};
use hn4_storage::{AnchorId, Volume, VolumeStats};
use serde::Serialize;
use tracing::info;

/// Object the scenario writes.
pub const EXERCISE_OBJECT: AnchorId = 0x1111;

const EXERCISE_BYTES: usize = 10_000;

/// Outcome of [`run_scenario`], printed as JSON by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct ExerciseReport {
    /// Object identity, hex
    pub object: String,
    /// Bytes written at offset 0
    pub bytes_written: usize,
    /// Blocks the initial write touched
    pub blocks_written: u64,
    /// Blocks newly marked used by the initial write
    pub blocks_allocated: u64,
    /// Object generation before the overwrite
    pub generation_before: u32,
    /// Generation stamped on the overwritten block
    pub generation_after: u32,
    /// Volume statistics at the end of the run
    pub stats: VolumeStats,
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed))
        .collect()
}

/// Writes 10000 bytes to object `0x1111`, reads them back, overwrites
/// block 1 and checks that blocks 0 and 2 are untouched.
pub fn run_scenario(vol: &Volume) -> Result<ExerciseReport> {
    let id = vol
        .create_anchor(Some(EXERCISE_OBJECT))
        .context("creating exercise object")?;

    let data = pattern(EXERCISE_BYTES, 1);
    let used_before = vol.stats().used_blocks;
    let blocks_written = vol.write_bytes(id, 0, &data)?;
    let blocks_allocated = vol.stats().used_blocks - used_before;
    info!(blocks_written, blocks_allocated, "initial write done");

    let read = vol.read_bytes(id, 0, EXERCISE_BYTES as u64)?;
    ensure!(read == data, "read-back of the initial write does not match");

    let last = (EXERCISE_BYTES as u64 - 1) / vol.payload_capacity() as u64;
    let neighbours: Vec<u64> = [0, 2].into_iter().filter(|&i| i <= last).collect();
    let before = neighbours
        .iter()
        .map(|&i| vol.read_block(id, i))
        .collect::<Result<Vec<_>, _>>()?;
    let generation_before = vol.anchor(id)?.generation;

    let replacement = pattern(vol.payload_capacity(), 0xA5);
    let receipt = vol.write_block(id, 1, &replacement)?;
    ensure!(
        receipt.generation == generation_before + 1,
        "overwrite generation {} is not {} + 1",
        receipt.generation,
        generation_before
    );
    ensure!(
        vol.read_block(id, 1)?.data == replacement,
        "overwritten block does not read back"
    );
    for (&index, old) in neighbours.iter().zip(&before) {
        let now = vol.read_block(id, index)?;
        ensure!(
            now.data == old.data && now.generation == old.generation,
            "block {} changed by the overwrite of block 1",
            index
        );
    }
    info!(generation = receipt.generation, lba = receipt.lba, "overwrite verified");

    Ok(ExerciseReport {
        object: format!("{:#x}", id),
        bytes_written: EXERCISE_BYTES,
        blocks_written,
        blocks_allocated,
        generation_before,
        generation_after: receipt.generation,
        stats: vol.stats(),
    })
}
