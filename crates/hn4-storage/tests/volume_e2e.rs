//! End-to-end tests: format, write, read and overwrite through the public
//! volume API on memory and file-backed devices.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use hn4_storage::{
    AnchorFlags, AnchorOptions, BitmapMode, DeviceClass, FileDevice, Hn4Error, MemDevice,
    ReadStatus, Volume, VolumeConfig,
};

fn config() -> VolumeConfig {
    VolumeConfig {
        rng_seed: Some(0x4E34),
        ..VolumeConfig::default()
    }
}

fn mem_volume(mib: u64, class: DeviceClass, config: VolumeConfig) -> (Arc<MemDevice>, Volume) {
    let dev = Arc::new(MemDevice::with_capacity(mib << 20, class).unwrap());
    let vol = Volume::format(dev.clone(), config).unwrap();
    (dev, vol)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn test_format_write_read_overwrite_64mib() {
    let (_dev, vol) = mem_volume(64, DeviceClass::Ssd, config());
    assert_eq!(vol.layout().total_blocks, 16384);
    assert_eq!(vol.payload_capacity(), 4048);

    let id = vol.create_anchor(Some(0x1111)).unwrap();
    let data = pattern(10_000, 7);
    let used_before = vol.stats().used_blocks;

    assert_eq!(vol.write_bytes(id, 0, &data).unwrap(), 3);
    assert_eq!(vol.stats().used_blocks, used_before + 3);
    assert_eq!(vol.read_bytes(id, 0, 10_000).unwrap(), data);
    assert_eq!(vol.anchor(id).unwrap().length, 10_000);

    let before: Vec<_> = (0..3).map(|i| vol.read_block(id, i).unwrap()).collect();
    let committed = vol.anchor(id).unwrap().generation;

    // The generation counter is per object: the overwrite advances the
    // object's committed generation by exactly one and stamps that value on
    // block 1. Block 1's own header moves from the generation of the write
    // that last touched it to the new one, skipping the values blocks 0 and
    // 2 received in between.
    let replacement = pattern(4048, 99);
    let receipt = vol.write_block(id, 1, &replacement).unwrap();
    assert_eq!(receipt.generation, committed + 1);
    assert_eq!(vol.anchor(id).unwrap().generation, committed + 1);

    let after: Vec<_> = (0..3).map(|i| vol.read_block(id, i).unwrap()).collect();
    assert_eq!(after[1].data, replacement);
    assert_eq!(after[1].generation, committed + 1);
    assert!(after[1].generation > before[1].generation);
    assert_eq!(before.iter().map(|b| b.generation).max(), Some(committed));
    for i in [0usize, 2] {
        assert_eq!(after[i].data, before[i].data);
        assert_eq!(after[i].generation, before[i].generation);
        assert_eq!(after[i].lba, before[i].lba);
    }
    assert_eq!(vol.stats().used_blocks, used_before + 3);
}

#[test]
fn test_partial_block_updates() {
    let (_dev, vol) = mem_volume(16, DeviceClass::Nvme, config());
    let id = vol.create_anchor(None).unwrap();
    vol.write_bytes(id, 0, &pattern(5000, 1)).unwrap();

    // Straddles the boundary between blocks 0 and 1.
    assert_eq!(vol.write_bytes(id, 4045, b"SPLICE").unwrap(), 2);
    let out = vol.read_bytes(id, 0, 6000).unwrap();
    let original = pattern(5000, 1);
    assert_eq!(out.len(), 5000);
    assert_eq!(&out[4045..4051], b"SPLICE");
    assert_eq!(&out[..4045], &original[..4045]);
    assert_eq!(&out[4051..], &original[4051..]);
}

#[test]
fn test_holes_read_as_zeros() {
    let (_dev, vol) = mem_volume(16, DeviceClass::Ssd, config());
    let id = vol.create_anchor(None).unwrap();
    vol.write_bytes(id, 3 * 4048, b"far").unwrap();

    let out = vol.read_bytes(id, 0, 3 * 4048 + 3).unwrap();
    assert!(out[..3 * 4048].iter().all(|&b| b == 0));
    assert_eq!(&out[3 * 4048..], b"far");
    assert_eq!(vol.read_block(id, 1).unwrap().status, ReadStatus::Sparse);
}

#[test]
fn test_compressed_object_roundtrip() {
    let (_dev, vol) = mem_volume(16, DeviceClass::Ssd, config());
    let id = vol
        .create_anchor_with(
            None,
            AnchorOptions {
                flags: AnchorFlags::COMPRESSED,
                ..AnchorOptions::default()
            },
        )
        .unwrap();
    let text = b"ballistic ".repeat(400);
    vol.write_block(id, 0, &text).unwrap();
    assert_eq!(vol.read_block(id, 0).unwrap().data, text);
}

#[test]
fn test_readers_never_see_torn_blocks() {
    let cfg = VolumeConfig {
        heal_on_read: false,
        ..config()
    };
    let (_dev, vol) = mem_volume(16, DeviceClass::Ssd, cfg);
    let vol = Arc::new(vol);
    let id = vol.create_anchor(None).unwrap();
    vol.write_block(id, 0, &[b'A'; 2000]).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let vol = Arc::clone(&vol);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut reads = 0u32;
                while !done.load(Ordering::Acquire) || reads < 50 {
                    let out = vol.read_block(id, 0).unwrap();
                    assert_ne!(out.status, ReadStatus::Sparse);
                    assert_eq!(out.data.len(), 2000);
                    let first = out.data[0];
                    assert!(first == b'A' || first == b'B');
                    assert!(out.data.iter().all(|&b| b == first));
                    reads += 1;
                }
            })
        })
        .collect();

    for i in 0..200 {
        let fill = if i % 2 == 0 { b'B' } else { b'A' };
        loop {
            match vol.write_block(id, 0, &[fill; 2000]) {
                Ok(_) => break,
                Err(Hn4Error::CommitContention { .. }) => continue,
                Err(e) => panic!("write failed: {e}"),
            }
        }
    }
    done.store(true, Ordering::Release);
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(vol.read_block(id, 0).unwrap().data, vec![b'A'; 2000]);
}

#[test]
fn test_concurrent_objects() {
    let (_dev, vol) = mem_volume(64, DeviceClass::Nvme, config());
    let vol = Arc::new(vol);
    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            let vol = Arc::clone(&vol);
            thread::spawn(move || {
                let id = vol.create_anchor(None).unwrap();
                let data = pattern(40_000, t);
                vol.write_bytes(id, 0, &data).unwrap();
                (id, data)
            })
        })
        .collect();
    for h in handles {
        let (id, data) = h.join().unwrap();
        assert_eq!(vol.read_bytes(id, 0, data.len() as u64).unwrap(), data);
    }
    assert_eq!(vol.stats().anchors, 4);
}

#[test]
fn test_file_backed_volume() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hn4.img");
    let dev = Arc::new(FileDevice::create(&path, 4096, 4096, DeviceClass::Ssd).unwrap());
    let vol = Volume::format(dev, config()).unwrap();

    let id = vol.create_anchor(None).unwrap();
    let data = pattern(9000, 3);
    vol.write_bytes(id, 0, &data).unwrap();
    assert_eq!(vol.read_bytes(id, 0, 9000).unwrap(), data);

    assert_eq!(std::fs::metadata(&path).unwrap().len(), 16 << 20);
    assert!(vol.stats().io.flushes > 0);
}

#[test]
fn test_sector_rmw_bitmap_heals_flipped_bit() {
    let cfg = VolumeConfig {
        bitmap_mode: BitmapMode::SectorRmw,
        ..config()
    };
    let (dev, vol) = mem_volume(16, DeviceClass::Ssd, cfg);
    let id = vol.create_anchor(None).unwrap();
    vol.write_block(id, 0, b"degraded mode").unwrap();
    vol.write_block(id, 0, b"degraded mode, again").unwrap();

    // Word 0 covers blocks 0..64; flip the bit of block 63 in its stored data.
    let bm = vol.allocator().bitmap();
    let was_set = bm.test(63).unwrap();
    let bitmap_byte = vol.layout().bitmap_start * u64::from(vol.layout().block_size);
    dev.flip_bit(bitmap_byte + 7, 7);

    assert_eq!(bm.test(63).unwrap(), was_set);
    assert_eq!(vol.stats().bitmap_heals, 1);
    assert_eq!(bm.test(63).unwrap(), was_set);
    assert_eq!(vol.stats().bitmap_heals, 1);
    assert_eq!(vol.read_block(id, 0).unwrap().data, b"degraded mode, again");
}

#[test]
fn test_saturation_hysteresis() {
    let (_dev, vol) = mem_volume(16, DeviceClass::Ssd, config());
    let layout = *vol.layout();
    let bm = vol.allocator().bitmap();

    let mut filled = Vec::new();
    let mut block = layout.flux_start;
    while !vol.allocator().is_saturated() {
        bm.set(block).unwrap();
        filled.push(block);
        block += 1;
    }
    let id = vol.create_anchor(None).unwrap();
    let spill = vol.write_block(id, 0, b"spill").unwrap();
    assert!(spill.linear);
    assert!(spill.lba >= layout.horizon_start);
    assert_eq!(vol.read_block(id, 0).unwrap().data, b"spill");

    // Dropping just below the entry mark keeps saturation on.
    let alloc = vol.allocator();
    while alloc.ballistic_usage_pct() >= 88 {
        bm.clear(filled.pop().unwrap()).unwrap();
    }
    assert!(alloc.is_saturated());

    while alloc.ballistic_usage_pct() >= 85 {
        bm.clear(filled.pop().unwrap()).unwrap();
    }
    assert!(!vol.allocator().is_saturated());

    for block in filled.drain(..) {
        bm.clear(block).unwrap();
    }

    let id = vol.create_anchor(None).unwrap();
    let r = vol.write_block(id, 0, b"ballistic again").unwrap();
    assert!(!r.linear);
}

#[test]
fn test_saturation_with_wide_horizon() {
    let wide = VolumeConfig {
        horizon_pct: 20,
        ..config()
    };
    let (_dev, vol) = mem_volume(16, DeviceClass::Ssd, wide);
    let layout = *vol.layout();
    assert_eq!(layout.horizon_blocks, 819);
    let bm = vol.allocator().bitmap();

    let mut block = layout.flux_start;
    while !vol.allocator().is_saturated() {
        assert!(block < layout.horizon_start, "flux filled without saturating");
        bm.set(block).unwrap();
        block += 1;
    }
    // 90% of the 3277 ballistic blocks, metadata included.
    assert_eq!(bm.used_blocks(), 2950);

    let id = vol.create_anchor(None).unwrap();
    let r = vol.write_block(id, 0, b"overflow").unwrap();
    assert!(r.linear);
    assert!(r.lba >= layout.horizon_start);
}

#[test]
fn test_zoned_volume_is_linear() {
    let (_dev, vol) = mem_volume(16, DeviceClass::Zns, config());
    let id = vol.create_anchor(None).unwrap();
    let data = pattern(12_000, 5);
    vol.write_bytes(id, 0, &data).unwrap();
    let anchor = vol.anchor(id).unwrap();
    assert!(anchor.flags.contains(AnchorFlags::LINEAR));
    assert_eq!(anchor.linear_map.len(), 3);
    assert_eq!(vol.read_bytes(id, 0, 12_000).unwrap(), data);
    assert_eq!(vol.stats().horizon_used, 3);
}

#[test]
fn test_stats_json() {
    let (_dev, vol) = mem_volume(16, DeviceClass::Hdd, config());
    let id = vol.create_anchor(None).unwrap();
    vol.write_block(id, 0, b"x").unwrap();
    vol.read_block(id, 0).unwrap();
    let json = serde_json::to_value(vol.stats()).unwrap();
    assert_eq!(json["writes"], 1);
    assert_eq!(json["reads"], 1);
    assert_eq!(json["device_class"], "hdd");
}
