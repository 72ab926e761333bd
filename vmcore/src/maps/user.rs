//! User view: unique token SIDs across the process set, resolved to
//! user/domain names through the well-known SID database.

use super::BuildCtx;
use crate::ob::{ObStrMap, TextRef};
use crate::proc::{Process, ProcessTable};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct UserEntry {
    pub sid: TextRef,
    pub user: TextRef,
    pub domain: TextRef,
    /// One process owning this SID (lowest pid).
    pub example_pid: u32,
}

#[derive(Debug, Default)]
pub struct UserMap {
    pub entries: Vec<UserEntry>,
    pub pool: String,
}

pub fn build(ctx: &BuildCtx, table: &ProcessTable) -> UserMap {
    let mut by_sid: BTreeMap<String, u32> = BTreeMap::new();
    for proc in table.list() {
        if !proc.is_live() {
            continue;
        }
        if let Some(sid) = token_sid(ctx, &proc) {
            by_sid.entry(sid).or_insert(proc.pid);
        }
    }

    let mut pool = ObStrMap::new();
    let mut map = UserMap::default();
    for (sid, pid) in by_sid {
        let (user, domain) = ctx.db.well_known_sid(&sid).unwrap_or(("", ""));
        map.entries.push(UserEntry {
            sid: pool.push(&sid),
            user: pool.push(user),
            domain: pool.push(domain),
            example_pid: pid,
        });
    }
    map.pool = pool.finalize();
    log::debug!("user map: {} unique sids", map.entries.len());
    map
}

/// Read the primary token SID of a process:
/// token -> UserAndGroups -> first _SID_AND_ATTRIBUTES -> SID.
fn token_sid(ctx: &BuildCtx, proc: &Arc<Process>) -> Option<String> {
    if proc.win.va_token == 0 {
        return None;
    }
    let off = &ctx.profile().token;
    let dtb = proc.dtb;
    let user_and_groups = ctx.read_ptr(dtb, proc.win.va_token + off.user_and_groups as u64)?;
    if user_and_groups == 0 {
        return None;
    }
    let sid_va = ctx.read_ptr(dtb, user_and_groups)?;
    if sid_va == 0 {
        return None;
    }
    let raw = ctx.read_struct(dtb, sid_va, 8 + 15 * 4)?;
    parse_sid(&raw)
}

/// Binary SID to "S-R-A-S1-S2-..." text.
fn parse_sid(raw: &[u8]) -> Option<String> {
    let revision = raw[0];
    let count = raw[1] as usize;
    if revision != 1 || count == 0 || count > 15 {
        return None;
    }
    let authority = u64::from_be_bytes([0, 0, raw[2], raw[3], raw[4], raw[5], raw[6], raw[7]]);
    let mut s = format!("S-{}-{}", revision, authority);
    for i in 0..count {
        let o = 8 + i * 4;
        let sub = u32::from_le_bytes(raw.get(o..o + 4)?.try_into().unwrap());
        s.push_str(&format!("-{}", sub));
    }
    Some(s)
}
