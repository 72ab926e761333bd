//! End-to-end scenarios against the synthetic 64-bit guest image.

mod common;

use common::{build, NTDLL_BASE, PID_SMSS, PID_SYSTEM, PID_WINLOGON, SEARCH_REGION, WINLOGON_PEB};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vmcore::maps::VadKind;
use vmcore::mem::search::SearchTerm;
use vmcore::plugin::{Plugin, PluginCtx, VfsEntry};
use vmcore::{ExtStatus, ReadFlags, VmmError};

fn read_to_string(vmm: &Arc<vmcore::Vmm>, path: &str) -> String {
    let mut buf = vec![0u8; 0x10000];
    let (n, _) = vmm.vfs_read(path, &mut buf, 0);
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

fn wait_status(vmm: &Arc<vmcore::Vmm>, pid: u32, wanted: &str, timeout: Duration) -> String {
    let path = format!("/pid/{}/search/status.txt", pid);
    let start = Instant::now();
    loop {
        let status = read_to_string(vmm, &path);
        if status.contains(wanted) {
            return status;
        }
        if start.elapsed() > timeout {
            panic!("status never reached {}; last:\n{}", wanted, status);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn open_list_root_close() {
    let t = build(false);
    let vmm = t.vmm;

    let root = vmm.vfs_list("/").unwrap();
    let names: Vec<&str> = root.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"pid"));
    assert!(names.contains(&"name"));

    let pids = vmm.vfs_list("/pid").unwrap();
    let dirs: Vec<&str> = pids.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(pids.len(), 4);
    assert!(dirs.contains(&"4"), "System must be listed");
    assert!(dirs.contains(&"500"));

    // the System process dir resolves and lists the process plugins
    let sys = vmm.vfs_list("/pid/4").unwrap();
    assert!(sys.iter().any(|e| e.name == "search" && e.is_dir));
    assert!(sys.iter().any(|e| e.name == "vmemd"));
    assert!(sys.iter().any(|e| e.name == "modules"));

    // name-addressed process dirs work too
    assert!(vmm.vfs_list("/name/winlogon.exe-500").is_ok());

    let start = Instant::now();
    vmm.close();
    assert!(start.elapsed() < Duration::from_secs(5), "close must not hang");
}

#[test]
fn process_table_contents() {
    let t = build(false);
    let vmm = &t.vmm;

    let procs = vmm.process_list().unwrap();
    assert_eq!(procs.len(), 4);
    let sys = vmm.process_get(PID_SYSTEM).unwrap();
    assert_eq!(sys.name, "System");
    assert!(!sys.user_only);

    let wl = vmm.process_get(PID_WINLOGON).unwrap();
    assert_eq!(wl.name, "winlogon.exe");
    assert_eq!(wl.ppid, PID_SMSS);
    assert!(wl.user_only);
    assert_eq!(wl.win.va_eprocess, t.winlogon_eprocess);

    assert_eq!(vmm.process_by_name("WINLOGON.EXE").unwrap().pid, PID_WINLOGON);
    assert!(matches!(
        vmm.process_get(999_999),
        Err(VmmError::InvalidPid { pid: 999_999 })
    ));

    t.vmm.close();
}

#[test]
fn virtual_read_of_peb() {
    let t = build(false);
    let vmm = &t.vmm;

    let mut buf = vec![0u8; 0x1000];
    let n = vmm.mem_read(Some(PID_WINLOGON), WINLOGON_PEB, &mut buf, ReadFlags::ZEROPAD).unwrap();
    assert_eq!(n, 0x1000);
    // BeingDebugged
    assert_eq!(buf[2], 0);
    // ImageBaseAddress points at the main module
    let image_base = u64::from_le_bytes(buf[0x10..0x18].try_into().unwrap());
    assert_eq!(image_base, common::WINLOGON_BASE);

    t.vmm.close();
}

#[test]
fn module_base_and_header() {
    let t = build(false);
    let vmm = &t.vmm;

    let base = vmm.process_module_base(PID_WINLOGON, "ntdll.dll").unwrap();
    assert_eq!(base, NTDLL_BASE);
    let mut mz = [0u8; 2];
    vmm.mem_read(Some(PID_WINLOGON), base, &mut mz, ReadFlags::ZEROPAD).unwrap();
    assert_eq!(&mz, b"MZ");

    let map = vmm.map_module(PID_WINLOGON).unwrap();
    assert_eq!(map.entries.len(), 2);
    let ntdll = map.find_by_name("ntdll.dll").unwrap();
    assert_eq!(ntdll.image_size, 0x1f0000);
    assert_eq!(ntdll.section_count, 3);
    assert_eq!(ntdll.eat_count, 7);
    assert_eq!(ntdll.iat_count, 5);
    assert_eq!(ntdll.full_path.get(&map.pool), "C:\\Windows\\System32\\ntdll.dll");

    t.vmm.close();
}

#[test]
fn map_builders_reconstruct_kernel_objects() {
    let t = build(false);
    let vmm = &t.vmm;

    // VADs: two images plus one private region, file name resolved
    let vads = vmm.map_vad(PID_WINLOGON).unwrap();
    assert_eq!(vads.entries.len(), 3);
    let ntdll = vads.find(NTDLL_BASE + 0x5000).unwrap();
    assert_eq!(ntdll.kind, VadKind::Image);
    assert_eq!(ntdll.file.get(&vads.pool), "\\Windows\\System32\\ntdll.dll");
    let heap_vad = vads.find(0x2000_0000).unwrap();
    assert_eq!(heap_vad.kind, VadKind::Private);

    // threads
    let threads = vmm.map_thread(PID_WINLOGON).unwrap();
    let tids: Vec<u32> = threads.entries.iter().map(|e| e.tid).collect();
    assert_eq!(tids, vec![0x21c, 0x220]);
    assert!(threads.entries.iter().all(|e| e.priority == 8 && e.state == 5));

    // handles
    let handles = vmm.map_handle(PID_WINLOGON).unwrap();
    assert_eq!(handles.entries.len(), 2);
    assert_eq!(handles.entries[0].handle, 4);
    assert_eq!(handles.entries[1].handle, 8);
    assert!(handles.entries.iter().all(|e| e.va_object >> 48 == 0xffff));

    // heaps: one sized through its VAD, one unknown
    let heaps = vmm.map_heap(PID_WINLOGON).unwrap();
    assert_eq!(heaps.entries.len(), 2);
    assert_eq!(heaps.entries[0].va, 0x2000_0000);
    assert_eq!(heaps.entries[0].size, 0x10000);
    assert!(heaps.entries[0].is_default);

    // kernel pool
    let pool = vmm.map_pool().unwrap();
    assert_eq!(pool.entries.len(), 3);
    assert_eq!(pool.with_tag(b"TcpE").count(), 2);

    // network endpoints resolve their owning process
    let net = vmm.map_net().unwrap();
    assert_eq!(net.entries.len(), 2);
    let est = net.entries.iter().find(|e| e.state == 5).unwrap();
    assert_eq!(est.pid, PID_WINLOGON);
    assert_eq!(est.local_addr.octets(), [10, 0, 0, 5]);
    assert_eq!(est.local_port, 49152);
    assert_eq!(est.remote_port, 443);

    // users: the shared SYSTEM token
    let users = vmm.map_user().unwrap();
    assert_eq!(users.entries.len(), 1);
    let u = &users.entries[0];
    assert_eq!(u.sid.get(&users.pool), "S-1-5-18");
    assert_eq!(u.user.get(&users.pool), "SYSTEM");

    // services from the SCM database
    let services = vmm.map_service().unwrap();
    assert_eq!(services.entries.len(), 2);
    assert_eq!(services.entries[0].name.get(&services.pool), "Dhcp");
    assert_eq!(services.entries[0].pid, 900);
    assert_eq!(services.entries[1].display.get(&services.pool), "Windows Event Log");

    t.vmm.close();
}

#[test]
fn pte_map_annotated_with_modules() {
    let t = build(false);
    let vmm = &t.vmm;

    let ptes = vmm.map_pte(PID_WINLOGON).unwrap();
    assert!(!ptes.entries.is_empty());
    let ntdll_run = ptes
        .entries
        .iter()
        .find(|e| e.va == NTDLL_BASE)
        .expect("ntdll header page must be a present run");
    assert_eq!(ntdll_run.module.get(&ptes.pool), "ntdll.dll");

    t.vmm.close();
}

#[test]
fn direct_search_with_alignment() {
    let t = build(false);
    let vmm = &t.vmm;

    let term =
        SearchTerm { pattern: b"\x4d\x5a\x90\x00".to_vec(), skip_mask: Vec::new(), align: 0x1000 };
    let hits = vmm
        .mem_search(PID_WINLOGON, term, SEARCH_REGION, SEARCH_REGION + 0x2fff)
        .unwrap();
    assert_eq!(hits, vec![SEARCH_REGION, SEARCH_REGION + 0x1000]);
    for h in &hits {
        assert_eq!(h % 0x1000, 0);
        let mut b = [0u8; 4];
        vmm.mem_read(Some(PID_WINLOGON), *h, &mut b, ReadFlags::ZEROPAD).unwrap();
        assert_eq!(&b, b"\x4d\x5a\x90\x00");
    }

    // unaligned hit appears once alignment drops to 1
    let term = SearchTerm { pattern: b"\x4d\x5a\x90\x00".to_vec(), skip_mask: Vec::new(), align: 1 };
    let hits = vmm
        .mem_search(PID_WINLOGON, term, SEARCH_REGION, SEARCH_REGION + 0x2fff)
        .unwrap();
    assert_eq!(hits.len(), 3);
    assert!(hits.contains(&(SEARCH_REGION + 0x2300)));

    t.vmm.close();
}

#[test]
fn search_plugin_end_to_end() {
    let t = build(false);
    let vmm = &t.vmm;
    let base = format!("/pid/{}/search", PID_WINLOGON);

    let files = vmm.vfs_list(&base).unwrap();
    for f in ["search.txt", "status.txt", "result.txt", "reset.txt", "align.txt", "readme.txt"] {
        assert!(files.iter().any(|e| e.name == f), "{} missing", f);
    }
    assert!(read_to_string(vmm, &format!("{}/status.txt", base)).contains("NOT_STARTED"));

    // constrain the scan, then commit the pattern
    vmm.vfs_write(&format!("{}/align.txt", base), b"0x1000", 0);
    vmm.vfs_write(&format!("{}/addr-min.txt", base), format!("{:x}", SEARCH_REGION).as_bytes(), 0);
    vmm.vfs_write(
        &format!("{}/addr-max.txt", base),
        format!("{:x}", SEARCH_REGION + 0x3000).as_bytes(),
        0,
    );
    assert_eq!(read_to_string(vmm, &format!("{}/align.txt", base)).trim(), "4096");

    let (n, st) = vmm.vfs_write(&format!("{}/search.txt", base), b"4d5a9000", 0);
    assert_eq!(st, ExtStatus::Success);
    assert_eq!(n, 8);

    let status = wait_status(vmm, PID_WINLOGON, "COMPLETED", Duration::from_secs(5));
    assert!(status.contains("Search hits:     2"), "unexpected status:\n{}", status);

    let results = read_to_string(vmm, &format!("{}/result.txt", base));
    let hits: Vec<u64> = results
        .lines()
        .map(|l| u64::from_str_radix(l.trim(), 16).unwrap())
        .collect();
    assert_eq!(hits, vec![SEARCH_REGION, SEARCH_REGION + 0x1000]);
    for h in &hits {
        assert_eq!(h % 0x1000, 0);
        let mut b = [0u8; 4];
        vmm.mem_read(Some(PID_WINLOGON), *h, &mut b, ReadFlags::ZEROPAD).unwrap();
        assert_eq!(&b, b"\x4d\x5a\x90\x00");
    }

    // a second commit while completed is ignored
    let before = read_to_string(vmm, &format!("{}/result.txt", base));
    vmm.vfs_write(&format!("{}/search.txt", base), b"11223344", 0);
    assert_eq!(read_to_string(vmm, &format!("{}/result.txt", base)), before);

    // reset drops the context
    vmm.vfs_write(&format!("{}/reset.txt", base), b"1", 0);
    wait_status(vmm, PID_WINLOGON, "NOT_STARTED", Duration::from_secs(2));

    t.vmm.close();
}

#[test]
fn abort_long_running_search() {
    let t = build(false);
    let vmm = &t.vmm;
    let base = format!("/pid/{}/search", PID_WINLOGON);

    // full user address space: will not complete on its own
    vmm.vfs_write(&format!("{}/search.txt", base), b"deadbeefcafe", 0);
    std::thread::sleep(Duration::from_millis(200));
    assert!(read_to_string(vmm, &format!("{}/status.txt", base)).contains("RUNNING"));

    vmm.vfs_write(&format!("{}/reset.txt", base), b"1", 0);
    wait_status(vmm, PID_WINLOGON, "NOT_STARTED", Duration::from_secs(2));

    let start = Instant::now();
    t.vmm.close();
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn write_then_read_through_cache() {
    let t = build(false);
    let vmm = &t.vmm;
    let va = SEARCH_REGION + 0x500;

    // warm the cache on this page first
    let mut warm = [0u8; 4];
    vmm.mem_read(Some(PID_WINLOGON), va, &mut warm, ReadFlags::ZEROPAD).unwrap();

    assert_eq!(vmm.mem_write(Some(PID_WINLOGON), va, b"\xaa\xbb\xcc\xdd").unwrap(), 4);
    let mut buf = [0u8; 4];
    vmm.mem_read(Some(PID_WINLOGON), va, &mut buf, ReadFlags::ZEROPAD).unwrap();
    assert_eq!(&buf, b"\xaa\xbb\xcc\xdd");

    // force a physical cache sweep, then read again
    vmm.config_set(vmcore::ConfigOpt::RefreshFreqMem, 1).unwrap();
    vmm.mem_read(Some(PID_WINLOGON), va, &mut buf, ReadFlags::ZEROPAD).unwrap();
    assert_eq!(&buf, b"\xaa\xbb\xcc\xdd");

    t.vmm.close();
}

#[test]
fn vmem_window_read_write() {
    let t = build(false);
    let vmm = &t.vmm;
    let base = format!("/pid/{}/vmemd", PID_WINLOGON);

    let files = vmm.vfs_list(&base).unwrap();
    assert_eq!(files.len(), 3, "one window per VAD");
    let ntdll_window = files
        .iter()
        .find(|e| e.name.contains("ntdll.dll"))
        .expect("ntdll window labeled with its backing file");

    let mut mz = [0u8; 2];
    let (n, st) = vmm.vfs_read(&format!("{}/{}", base, ntdll_window.name), &mut mz, 0);
    assert_eq!((n, st), (2, ExtStatus::Success));
    assert_eq!(&mz, b"MZ");

    // write through the private heap window and read it back
    let heap_window = files.iter().find(|e| e.name.starts_with("0000000020000000")).unwrap();
    let path = format!("{}/{}", base, heap_window.name);
    let (n, st) = vmm.vfs_write(&path, b"HEAP", 0x10);
    assert_eq!((n, st), (4, ExtStatus::Success));
    let mut back = [0u8; 4];
    vmm.vfs_read(&path, &mut back, 0x10);
    assert_eq!(&back, b"HEAP");

    t.vmm.close();
}

#[test]
fn modules_plugin_files() {
    let t = build(false);
    let vmm = &t.vmm;
    let base = format!("/pid/{}/modules", PID_WINLOGON);

    let files = vmm.vfs_list(&base).unwrap();
    assert!(files.iter().any(|e| e.name == "modules.txt" && !e.is_dir));
    assert!(files.iter().any(|e| e.name == "ntdll.dll" && e.is_dir));

    let txt = read_to_string(vmm, &format!("{}/modules.txt", base));
    assert_eq!(txt.lines().count(), 2);
    assert!(txt.contains("ntdll.dll"));

    let b = read_to_string(vmm, &format!("{}/ntdll.dll/base.txt", base));
    assert_eq!(u64::from_str_radix(b.trim(), 16).unwrap(), NTDLL_BASE);

    // unknown files inside a known plugin are invalid
    let mut buf = [0u8; 16];
    let (_, st) = vmm.vfs_read(&format!("{}/nope.txt", base), &mut buf, 0);
    assert_eq!(st, ExtStatus::FileInvalid);

    t.vmm.close();
}

#[test]
fn vanished_process_read_is_file_invalid() {
    let t = build(false);
    let vmm = &t.vmm;
    let mut buf = [0u8; 16];
    let (n, st) = vmm.vfs_read("/pid/999999/search/status.txt", &mut buf, 0);
    assert_eq!((n, st), (0, ExtStatus::FileInvalid));
    let (_, st) = vmm.vfs_write("/pid/999999/search/search.txt", b"4d5a", 0);
    assert_eq!(st, ExtStatus::FileInvalid);
    t.vmm.close();
}

struct NopPlugin;

impl Plugin for NopPlugin {
    fn list(&self, _ctx: &PluginCtx, out: &mut Vec<VfsEntry>) -> bool {
        out.push(VfsEntry::file("nop.txt", 0));
        true
    }
}

#[test]
fn plugin_register_unregister_roundtrip() {
    let t = build(false);
    let vmm = &t.vmm;

    vmm.plugin_register("p", true, false, Arc::new(NopPlugin)).unwrap();
    assert!(vmm.plugin_register("p", true, false, Arc::new(NopPlugin)).is_err());
    let names: Vec<String> = vmm.vfs_list("/").unwrap().into_iter().map(|e| e.name).collect();
    assert!(names.contains(&"p".to_string()));
    assert!(vmm.vfs_list("/p").unwrap().iter().any(|e| e.name == "nop.txt"));

    assert!(vmm.plugin_unregister("p"));
    let names: Vec<String> = vmm.vfs_list("/").unwrap().into_iter().map(|e| e.name).collect();
    assert!(!names.contains(&"p".to_string()));

    t.vmm.close();
}

#[test]
fn list_is_stable_within_a_tick() {
    let t = build(false);
    let vmm = &t.vmm;
    let a = vmm.vfs_list("/pid").unwrap();
    let b = vmm.vfs_list("/pid").unwrap();
    assert_eq!(a, b);
    t.vmm.close();
}

#[test]
fn close_invalidates_handle() {
    let t = build(false);
    let vmm = t.vmm.clone();
    vmm.close();
    assert!(matches!(vmm.process_list(), Err(VmmError::HandleInvalid)));
    assert!(matches!(vmm.config_get(vmcore::ConfigOpt::VersionMajor), Err(VmmError::HandleInvalid)));
    // a second close is a no-op
    vmm.close();
}

#[test]
fn config_surface() {
    let t = build(false);
    let vmm = &t.vmm;

    assert_eq!(vmm.config_get(vmcore::ConfigOpt::MemoryModel).unwrap(), 3);
    assert_eq!(vmm.config_get(vmcore::ConfigOpt::VersionMajor).unwrap(), 0);
    vmm.config_set(vmcore::ConfigOpt::TickPeriodMs, 50).unwrap();
    assert_eq!(vmm.config_get(vmcore::ConfigOpt::TickPeriodMs).unwrap(), 50);
    assert!(vmm.config_set(vmcore::ConfigOpt::TickPeriodMs, 0).is_err());
    assert!(vmm.config_set(vmcore::ConfigOpt::ForensicMode, 9).is_err());
    vmm.config_set(vmcore::ConfigOpt::ForensicMode, 2).unwrap();
    assert_eq!(vmm.config_get(vmcore::ConfigOpt::ForensicMode).unwrap(), 2);
    // write-only options refuse reads
    assert!(vmm.config_get(vmcore::ConfigOpt::RefreshFreqSlow).is_err());

    t.vmm.close();
}
