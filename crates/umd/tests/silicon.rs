//! End-to-end scenarios against real silicon.
//!
//! These tests drive an attached accelerator and are ignored by default;
//! run them with `cargo test -- --ignored` on a machine with hardware.

use std::sync::Arc;
use std::time::Duration;

use ttumd::chip::LocalChip;
use ttumd::types::tlb::TlbOrdering;
use ttumd::XyPair;

/// Scratch region in tensix L1 the tests are free to clobber.
const DATA_BUFFER_SPACE_BASE: u64 = 0x1_0000;

fn open_chip() -> LocalChip {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    LocalChip::open_pcie(0, 0, 0).expect("no accelerator on PCIe device 0")
}

#[test]
#[ignore = "requires silicon"]
fn static_tlb_write_readback() -> anyhow::Result<()> {
    let chip = open_chip();
    let core = XyPair::new(1, 1);
    chip.configure_tlb(core, 1 << 20, DATA_BUFFER_SPACE_BASE, TlbOrdering::Relaxed)?;

    let values: Vec<u8> = (0..10u32).flat_map(|v| v.to_le_bytes()).collect();
    chip.write_to_device(core, &values, DATA_BUFFER_SPACE_BASE)?;

    let mut read_back = vec![0u8; values.len()];
    chip.read_from_device(core, &mut read_back, DATA_BUFFER_SPACE_BASE)?;
    assert_eq!(read_back, values);

    let zeroes = vec![0u8; values.len()];
    chip.write_to_device(core, &zeroes, DATA_BUFFER_SPACE_BASE)?;
    chip.read_from_device(core, &mut read_back, DATA_BUFFER_SPACE_BASE)?;
    assert_eq!(read_back, zeroes);
    Ok(())
}

#[test]
#[ignore = "requires silicon"]
fn sysmem_visible_through_pcie_core() -> anyhow::Result<()> {
    let chip = LocalChip::open_pcie(0, 0, 1)?;
    let sysmem = chip.sysmem()?;
    assert!(sysmem.get_num_host_mem_channels() >= 1);

    let pattern: Vec<u8> = (0..0x4000u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 16) as u8)
        .collect();
    chip.write_to_sysmem(0, &pattern, 0)?;

    // The PCIe core window exposes the pinned channel at its NOC address.
    let pcie_core = XyPair::new(0, 3);
    let noc_base = sysmem.get_hugepage_mapping(0)?.noc_address;
    let mut read_back = vec![0u8; pattern.len()];
    chip.read_from_device(pcie_core, &mut read_back, noc_base)?;
    assert_eq!(read_back, pattern);
    Ok(())
}

#[test]
#[ignore = "requires silicon"]
fn concurrent_threads_do_not_interfere() {
    let chip = Arc::new(open_chip());
    let cores: Vec<XyPair> = (1..=4).map(|x| XyPair::new(x, 1)).collect();

    let vector_a: Vec<u8> = (0..2560u32).flat_map(|v| v.to_le_bytes()).collect();
    let vector_b: Vec<u8> = (2560..5120u32).flat_map(|v| v.to_le_bytes()).collect();
    let addr_a = DATA_BUFFER_SPACE_BASE;
    let addr_b = DATA_BUFFER_SPACE_BASE + 2560 * 4;

    let spawn_worker = |data: Vec<u8>, addr: u64| {
        let chip = Arc::clone(&chip);
        let cores = cores.clone();
        std::thread::spawn(move || {
            for _ in 0..50 {
                for &core in &cores {
                    chip.write_to_device(core, &data, addr).unwrap();
                }
                chip.l1_membar(&cores).unwrap();
                for &core in &cores {
                    let mut read_back = vec![0u8; data.len()];
                    chip.read_from_device(core, &mut read_back, addr).unwrap();
                    assert_eq!(read_back, data);
                }
            }
        })
    };

    let worker_a = spawn_worker(vector_a, addr_a);
    let worker_b = spawn_worker(vector_b, addr_b);
    worker_a.join().unwrap();
    worker_b.join().unwrap();
}

#[test]
#[ignore = "requires a two-chip system"]
fn remote_write_is_observable_after_flush() {
    use ttumd::chip::RemoteChip;
    use ttumd::EthCoord;

    let gateway = Arc::new(open_chip());
    let remote = RemoteChip::open(
        1,
        Arc::clone(&gateway),
        EthCoord {
            x: 1,
            y: 0,
            rack: 0,
            shelf: 0,
        },
    )
    .unwrap();

    let core = XyPair::new(1, 1);
    let value = 0xDEAD_BEEFu32.to_le_bytes();
    remote
        .write_to_device(core, &value, DATA_BUFFER_SPACE_BASE)
        .unwrap();
    remote.wait_for_non_mmio_flush().unwrap();

    let mut read_back = [0u8; 4];
    remote
        .read_from_device(core, &mut read_back, DATA_BUFFER_SPACE_BASE)
        .unwrap();
    assert_eq!(read_back, value);
}

#[test]
#[ignore = "requires silicon"]
fn arc_message_round_trip() {
    let chip = open_chip();
    // 0xAA90: a benign firmware query (AICLK get) on current firmware.
    let (exit_code, _out3, _out4) = chip
        .arc_msg(0xAA90, true, 0, 0, Duration::from_secs(1))
        .unwrap();
    assert_eq!(exit_code, 0);
}
