//! Host-to-remote-chip transactions tunneled over on-die Ethernet.
//!
//! The local chip reserves a set of Ethernet worker cores. The host writes
//! command blocks into a core's L1 request queue and bumps the write
//! pointer; routing firmware drains the queue, forwards to the target chip
//! by ethernet coordinate, and advances the read pointer once the remote
//! side acknowledged. Frames in one queue execute in order; across queues
//! there is no mutual ordering without a barrier.

use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::arch::EthInterfaceParams;
use crate::error::{Error, Result};
use crate::protocol::pcie::PcieProtocol;
use crate::types::{EthCoord, XyPair};

/// Size of one command block in the L1 queue.
const CMD_SIZE: u64 = 32;

/// Bound on the firmware-drain spin waits.
const REMOTE_FLUSH_TIMEOUT: Duration = Duration::from_secs(60);

/// One command block, laid out exactly as the routing firmware reads it.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
struct RoutingCmd {
    sys_addr: u64,
    /// Inline payload word, or the block length when `CMD_DATA_BLOCK` is set.
    data: u32,
    flags: u32,
    rack: u16,
    src_resp_buf_index: u16,
    local_buf_index: u32,
    src_resp_q_id: u8,
    host_mem_txn_id: u8,
    padding: u16,
    src_addr_tag: u32,
}

impl RoutingCmd {
    fn as_bytes(&self) -> [u8; CMD_SIZE as usize] {
        // SAFETY: RoutingCmd is repr(C), 32 bytes, all fields POD.
        unsafe { std::mem::transmute(*self) }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut cmd = [0u8; CMD_SIZE as usize];
        cmd.copy_from_slice(bytes);
        // SAFETY: any 32-byte pattern is a valid RoutingCmd.
        unsafe { std::mem::transmute(cmd) }
    }
}

/// Pack a `(chip, core, address)` target into the firmware's system address.
fn get_sys_addr(
    params: &EthInterfaceParams,
    local_bits: u32,
    id_bits: u32,
    target: EthCoord,
    core: XyPair,
    addr: u64,
) -> (u64, u16) {
    let mut sys_addr = target.x as u64;
    sys_addr = (sys_addr << id_bits) | target.y as u64;
    sys_addr = (sys_addr << id_bits) | core.x as u64;
    sys_addr = (sys_addr << id_bits) | core.y as u64;
    sys_addr = (sys_addr << local_bits) | addr;

    let rack = target.rack as u16 | ((target.shelf as u16) << params.eth_rack_coord_width);
    (sys_addr, rack)
}

/// Tunnels non-local transactions through the local chip's Ethernet cores.
pub struct RemoteCommunication {
    local: Arc<PcieProtocol>,
    params: &'static EthInterfaceParams,
    eth_cores: &'static [XyPair],
    noc_local_bits: u32,
    noc_id_bits: u32,
    /// Serializes the queue pointer dance between threads of this process.
    queue_state: Mutex<()>,
    /// Round-robin over the transfer cores.
    active_core: AtomicUsize,
}

impl RemoteCommunication {
    pub fn new(local: Arc<PcieProtocol>) -> Result<Self> {
        let arch = local.pci_device().get_arch();
        let eth_cores = arch.remote_transfer_eth_cores()?;
        Ok(Self {
            local,
            params: arch.eth_interface_params(),
            eth_cores,
            noc_local_bits: 36,
            noc_id_bits: 6,
            queue_state: Mutex::new(()),
            active_core: AtomicUsize::new(0),
        })
    }

    fn next_core(&self) -> XyPair {
        let index = self.active_core.fetch_add(1, AtomicOrdering::Relaxed);
        self.eth_cores[index % self.eth_cores.len()]
    }

    fn read_l1_word(&self, eth_core: XyPair, addr: u64) -> Result<u32> {
        let mut word = [0u8; 4];
        self.local.read_from_device(&mut word, eth_core, addr)?;
        Ok(u32::from_le_bytes(word))
    }

    fn write_l1_word(&self, eth_core: XyPair, addr: u64, value: u32) -> Result<()> {
        self.local.write_to_device(&value.to_le_bytes(), eth_core, addr)
    }

    fn queue_full(&self, wrptr: u32, rdptr: u32) -> bool {
        // Pointers run over twice the buffer depth so full and empty are
        // distinguishable.
        wrptr != rdptr && (wrptr & self.params.cmd_buf_size_mask) == (rdptr & self.params.cmd_buf_size_mask)
    }

    fn wait_not_full(&self, eth_core: XyPair, wrptr: u32) -> Result<u32> {
        let rdptr_addr = self.params.request_cmd_queue_base
            + self.params.remote_update_ptr_size_bytes as u64;
        let start = Instant::now();
        loop {
            let rdptr = self.read_l1_word(eth_core, rdptr_addr)?;
            if !self.queue_full(wrptr, rdptr) {
                return Ok(rdptr);
            }
            if start.elapsed() > REMOTE_FLUSH_TIMEOUT {
                return Err(Error::Timeout {
                    what: format!("routing command queue space on ethernet core {eth_core}"),
                    elapsed: start.elapsed(),
                });
            }
            std::hint::spin_loop();
        }
    }

    /// Write `src` to `(core, addr)` on the chip at `target`.
    pub fn write_to_non_mmio(
        &self,
        target: EthCoord,
        core: XyPair,
        src: &[u8],
        addr: u64,
    ) -> Result<()> {
        let _state = self.lock_state();
        let eth_core = self.next_core();
        let params = self.params;
        let req_base = params.request_cmd_queue_base;

        let mut offset = 0usize;
        while offset < src.len() {
            let chunk = (src.len() - offset).min(params.max_block_size as usize);
            let chunk_addr = addr + offset as u64;

            let wrptr = self.read_l1_word(eth_core, req_base)?;
            self.wait_not_full(eth_core, wrptr)?;
            let buf_index = (wrptr & params.cmd_buf_size_mask) as u64;

            let (sys_addr, rack) = get_sys_addr(
                params,
                self.noc_local_bits,
                self.noc_id_bits,
                target,
                core,
                chunk_addr,
            );

            let mut cmd = RoutingCmd {
                sys_addr,
                rack,
                flags: params.cmd_wr_req,
                ..Default::default()
            };

            if chunk > 4 {
                // Stage the payload in this buffer slot's data block; the
                // command then carries only the length.
                let block_addr =
                    params.eth_routing_data_buffer_addr + buf_index * params.max_block_size as u64;
                self.local.write_to_device(
                    &src[offset..offset + chunk],
                    eth_core,
                    block_addr,
                )?;
                cmd.flags |= params.cmd_data_block;
                cmd.data = chunk as u32;
            } else {
                let mut word = [0u8; 4];
                word[..chunk].copy_from_slice(&src[offset..offset + chunk]);
                cmd.data = u32::from_le_bytes(word);
            }

            trace!(
                chip = %target,
                core = %core,
                addr = format_args!("{chunk_addr:#x}"),
                len = chunk,
                "remote write frame"
            );

            let cmd_addr =
                req_base + params.cmd_counters_size_bytes as u64 + buf_index * CMD_SIZE;
            self.local.write_to_device(&cmd.as_bytes(), eth_core, cmd_addr)?;

            // Publishing the write pointer hands the frame to firmware; it
            // must land after the command block, which the Strict ordering of
            // the local PCIe path guarantees.
            let new_wrptr = (wrptr + 1) & params.cmd_buf_ptr_mask;
            self.write_l1_word(eth_core, req_base, new_wrptr)?;

            offset += chunk;
        }
        Ok(())
    }

    /// Read `dest.len()` bytes from `(core, addr)` on the chip at `target`.
    pub fn read_non_mmio(
        &self,
        target: EthCoord,
        core: XyPair,
        dest: &mut [u8],
        addr: u64,
    ) -> Result<()> {
        let _state = self.lock_state();
        let eth_core = self.next_core();
        let params = self.params;
        let req_base = params.request_cmd_queue_base;
        let resp_base = params.response_cmd_queue_base;

        let mut offset = 0usize;
        while offset < dest.len() {
            let chunk = (dest.len() - offset).min(params.max_block_size as usize);
            let chunk_addr = addr + offset as u64;

            let wrptr = self.read_l1_word(eth_core, req_base)?;
            self.wait_not_full(eth_core, wrptr)?;
            let buf_index = (wrptr & params.cmd_buf_size_mask) as u64;

            let (sys_addr, rack) = get_sys_addr(
                params,
                self.noc_local_bits,
                self.noc_id_bits,
                target,
                core,
                chunk_addr,
            );

            let mut cmd = RoutingCmd {
                sys_addr,
                rack,
                flags: params.cmd_rd_req,
                ..Default::default()
            };
            if chunk > 4 {
                cmd.flags |= params.cmd_data_block;
                cmd.data = chunk as u32;
            }

            // Remember where the response queue stands before the request.
            let resp_wrptr_before = self.read_l1_word(eth_core, resp_base)?;

            let cmd_addr =
                req_base + params.cmd_counters_size_bytes as u64 + buf_index * CMD_SIZE;
            self.local.write_to_device(&cmd.as_bytes(), eth_core, cmd_addr)?;
            let new_wrptr = (wrptr + 1) & params.cmd_buf_ptr_mask;
            self.write_l1_word(eth_core, req_base, new_wrptr)?;

            // Wait for the firmware to post the matching response.
            let start = Instant::now();
            let resp_wrptr = loop {
                let now = self.read_l1_word(eth_core, resp_base)?;
                if now != resp_wrptr_before {
                    break now;
                }
                if start.elapsed() > REMOTE_FLUSH_TIMEOUT {
                    return Err(Error::Timeout {
                        what: format!("read response from ethernet core {eth_core}"),
                        elapsed: start.elapsed(),
                    });
                }
                std::hint::spin_loop();
            };
            let resp_index = (resp_wrptr_before & params.cmd_buf_size_mask) as u64;

            let resp_cmd_addr =
                resp_base + params.cmd_counters_size_bytes as u64 + resp_index * CMD_SIZE;
            let mut resp_bytes = [0u8; CMD_SIZE as usize];
            self.local
                .read_from_device(&mut resp_bytes, eth_core, resp_cmd_addr)?;
            let resp = RoutingCmd::from_bytes(&resp_bytes);

            if resp.flags & params.cmd_data_block != 0 {
                // Response payloads use the slots above the request blocks so
                // concurrent writes cannot clobber them.
                let block_addr = params.eth_routing_data_buffer_addr
                    + (params.cmd_buf_size as u64 + resp_index) * params.max_block_size as u64;
                self.local.read_from_device(
                    &mut dest[offset..offset + chunk],
                    eth_core,
                    block_addr,
                )?;
            } else {
                let word = resp.data.to_le_bytes();
                dest[offset..offset + chunk].copy_from_slice(&word[..chunk]);
            }

            // Hand the response slot back to the firmware.
            let resp_rdptr_addr =
                resp_base + params.remote_update_ptr_size_bytes as u64;
            let resp_rdptr = self.read_l1_word(eth_core, resp_rdptr_addr)?;
            self.write_l1_word(
                eth_core,
                resp_rdptr_addr,
                (resp_rdptr + 1) & params.cmd_buf_ptr_mask,
            )?;

            offset += chunk;
        }
        Ok(())
    }

    /// Spin until every outstanding command-queue entry on every transfer
    /// core has been acknowledged. Required before any host read that must
    /// observe the effect of prior remote writes.
    pub fn wait_for_non_mmio_flush(&self) -> Result<()> {
        let _state = self.lock_state();
        let params = self.params;
        let req_base = params.request_cmd_queue_base;
        let rdptr_addr = req_base + params.remote_update_ptr_size_bytes as u64;

        for &eth_core in self.eth_cores {
            let start = Instant::now();
            loop {
                let wrptr = self.read_l1_word(eth_core, req_base)?;
                let rdptr = self.read_l1_word(eth_core, rdptr_addr)?;
                if wrptr == rdptr {
                    break;
                }
                if start.elapsed() > REMOTE_FLUSH_TIMEOUT {
                    return Err(Error::Timeout {
                        what: format!("non-MMIO flush on ethernet core {eth_core}"),
                        elapsed: start.elapsed(),
                    });
                }
                std::hint::spin_loop();
            }
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ()> {
        self.queue_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for RemoteCommunication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCommunication")
            .field("eth_cores", &self.eth_cores.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ETH_INTERFACE_PARAMS;

    #[test]
    fn routing_cmd_is_one_queue_slot() {
        assert_eq!(std::mem::size_of::<RoutingCmd>(), CMD_SIZE as usize);
    }

    #[test]
    fn routing_cmd_round_trips_through_bytes() {
        let cmd = RoutingCmd {
            sys_addr: 0x1234_5678_9ABC,
            data: 0xDEAD_BEEF,
            flags: ETH_INTERFACE_PARAMS.cmd_wr_req | ETH_INTERFACE_PARAMS.cmd_data_block,
            rack: 0x21,
            ..Default::default()
        };
        let decoded = RoutingCmd::from_bytes(&cmd.as_bytes());
        assert_eq!(decoded.sys_addr, cmd.sys_addr);
        assert_eq!(decoded.data, cmd.data);
        assert_eq!(decoded.flags, cmd.flags);
        assert_eq!(decoded.rack, cmd.rack);
    }

    #[test]
    fn sys_addr_packs_target_fields() {
        let params = &ETH_INTERFACE_PARAMS;
        let target = EthCoord {
            x: 1,
            y: 2,
            rack: 3,
            shelf: 1,
        };
        let (sys_addr, rack) =
            get_sys_addr(params, 36, 6, target, XyPair::new(9, 0), 0x1000);
        assert_eq!(sys_addr & ((1 << 36) - 1), 0x1000);
        assert_eq!((sys_addr >> 36) & 0x3F, 0); // core y
        assert_eq!((sys_addr >> 42) & 0x3F, 9); // core x
        assert_eq!((sys_addr >> 48) & 0x3F, 2); // chip y
        assert_eq!((sys_addr >> 54) & 0x3F, 1); // chip x
        assert_eq!(rack, 3 | (1 << params.eth_rack_coord_width));
    }
}
