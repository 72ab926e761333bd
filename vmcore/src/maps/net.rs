//! Network endpoint view.
//!
//! TCP endpoints are located by scanning the kernel big-pool for `TcpE`
//! allocations and decoding each candidate record. Records whose owning
//! process pointer does not resolve to a known process are discarded.

use super::{u32_at, u64_at, BuildCtx, PoolMap};
use crate::proc::{Process, ProcessTable};
use std::net::Ipv4Addr;

pub const TCP_TAG: [u8; 4] = *b"TcpE";

#[derive(Debug, Clone, Copy)]
pub struct NetEntry {
    pub pid: u32,
    /// MIB TCP state number.
    pub state: u32,
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
    pub va: u64,
}

#[derive(Debug, Default)]
pub struct NetMap {
    pub entries: Vec<NetEntry>,
}

pub fn build(
    ctx: &BuildCtx,
    system: &Process,
    pool: &PoolMap,
    table: &ProcessTable,
) -> NetMap {
    let mut map = NetMap::default();
    let off = &ctx.profile().tcp;
    let dtb = system.dtb;

    for alloc in pool.with_tag(&TCP_TAG) {
        if alloc.size < off.size as u64 {
            continue;
        }
        let Some(rec) = ctx.read_struct(dtb, alloc.va, off.size as usize) else {
            continue;
        };
        let owner = u64_at(&rec, off.owning_process);
        // back-edge is weak: resolve the EPROCESS address through the table
        let Some(pid) = table.list().iter().find(|p| p.win.va_eprocess == owner).map(|p| p.pid)
        else {
            continue;
        };
        let state = u32_at(&rec, off.state);
        if state > 13 {
            continue;
        }
        // addresses and ports are stored in network byte order
        map.entries.push(NetEntry {
            pid,
            state,
            local_addr: ipv4_at(&rec, off.local_addr),
            local_port: port_at(&rec, off.local_port),
            remote_addr: ipv4_at(&rec, off.remote_addr),
            remote_port: port_at(&rec, off.remote_port),
            va: alloc.va,
        });
    }
    map.entries.sort_by_key(|e| (e.pid, e.local_port));
    log::debug!("net map: {} tcp endpoints", map.entries.len());
    map
}

fn ipv4_at(rec: &[u8], off: u32) -> Ipv4Addr {
    let o = off as usize;
    match rec.get(o..o + 4) {
        Some(b) => Ipv4Addr::new(b[0], b[1], b[2], b[3]),
        None => Ipv4Addr::UNSPECIFIED,
    }
}

fn port_at(rec: &[u8], off: u32) -> u16 {
    let o = off as usize;
    rec.get(o..o + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .unwrap_or(0)
}
