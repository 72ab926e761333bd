//! Synthetic 64-bit guest image used by the integration tests.
//!
//! Builds a small physical memory image containing real 4-level page
//! tables, a kernel process list, per-process user mappings, loader lists,
//! VAD trees, a handle table, a big-pool table with TCP endpoints and a
//! service database. The engine is pointed at it like at any other dump.

use std::sync::Arc;
use vmcore::mem::devices::RamDevice;
use vmcore::sym::{
    EprocessOffsets, EthreadOffsets, FileRefOffsets, HandleTableOffsets, LdrOffsets, OffsetProfile,
    PebOffsets, PoolOffsets, ServiceOffsets, StaticOffsetDb, StaticSymbols, TcpEndpointOffsets,
    TokenOffsets, VadOffsets,
};
use vmcore::{DeviceSpec, MemoryModel, Vmm, VmmArgs};

pub const IMAGE_SIZE: usize = 0x0100_0000;
pub const PAGE: u64 = 0x1000;

const PTE_FLAGS: u64 = 0x63; // P | RW | US | A | D

pub const KVA: u64 = 0xffff_8000_0000_0000;
pub const VA_PS_HEAD: u64 = KVA + 0x0020_1000;
pub const VA_EPROC_PAGE: u64 = KVA + 0x0020_2000;
pub const VA_POOL_GLOBALS: u64 = KVA + 0x0020_3000;

pub const PID_SYSTEM: u32 = 4;
pub const PID_SMSS: u32 = 328;
pub const PID_WINLOGON: u32 = 500;
pub const PID_SERVICES: u32 = 600;

pub const WINLOGON_PEB: u64 = 0x0000_7ff7_0000_1000;
pub const WINLOGON_BASE: u64 = 0x0000_7ff6_0000_0000;
pub const NTDLL_BASE: u64 = 0x0000_7ffa_0000_0000;
pub const SEARCH_REGION: u64 = 0x0000_0000_1000_0000;

/// Compact test layout; field meanings match the production profiles.
pub fn test_profile() -> OffsetProfile {
    OffsetProfile {
        build: 1,
        is_64: true,
        eprocess: EprocessOffsets {
            unique_process_id: 0x00,
            active_process_links: 0x08,
            inherited_from_pid: 0x18,
            dtb: 0x20,
            dtb_user: 0,
            peb: 0x28,
            wow64_process: 0x30,
            session: 0x38,
            token: 0x40,
            thread_list_head: 0x48,
            vad_root: 0x58,
            object_table: 0x60,
            image_file_name: 0x68,
            size: 0x80,
        },
        ethread: EthreadOffsets {
            thread_list_entry: 0x00,
            cid_unique_thread: 0x10,
            teb: 0x18,
            start_address: 0x20,
            win32_start_address: 0x28,
            priority: 0x30,
            state: 0x31,
            size: 0x40,
        },
        ldr: LdrOffsets {
            peb_ldr: 0x18,
            in_load_order_list: 0x10,
            dll_base: 0x30,
            entry_point: 0x38,
            size_of_image: 0x40,
            full_dll_name: 0x48,
            base_dll_name: 0x58,
            size: 0x68,
        },
        vad: VadOffsets {
            node_left: 0x00,
            node_right: 0x08,
            starting_vpn: 0x18,
            ending_vpn: 0x1c,
            starting_vpn_high: 0x20,
            ending_vpn_high: 0x21,
            flags: 0x30,
            subsection: 0x48,
            size: 0x50,
        },
        peb: PebOffsets {
            image_base_address: 0x10,
            number_of_heaps: 0xe8,
            process_heaps: 0xf0,
            being_debugged: 0x02,
        },
        handle_table: HandleTableOffsets { table_code: 0x08, entry_size: 16 },
        file_ref: FileRefOffsets {
            subsection_control_area: 0x00,
            control_area_file_pointer: 0x40,
            file_object_file_name: 0x58,
        },
        token: TokenOffsets { user_and_groups: 0x08 },
        pool: PoolOffsets { entry_size: 0x18, va: 0x00, key: 0x08, bytes: 0x10 },
        tcp: TcpEndpointOffsets {
            state: 0x6c,
            local_addr: 0x70,
            local_port: 0x74,
            remote_addr: 0x78,
            remote_port: 0x7c,
            owning_process: 0x80,
            size: 0x88,
        },
        service: ServiceOffsets {
            list_entry: 0x00,
            ordinal: 0x10,
            name_ptr: 0x18,
            display_ptr: 0x20,
            state: 0x28,
            pid: 0x2c,
            size: 0x30,
        },
    }
}

pub struct ImageBuilder {
    pub img: Vec<u8>,
    next_page: u64,
    pub kernel_dtb: u64,
}

impl ImageBuilder {
    pub fn new() -> Self {
        let mut b = Self { img: vec![0u8; IMAGE_SIZE], next_page: 0x0010_0000, kernel_dtb: 0 };
        b.kernel_dtb = b.alloc_page();
        // self-referencing entry plus a pre-allocated kernel-half pdpt so
        // process tables can share the kernel mappings by copying one entry
        let kernel_pdpt = b.alloc_page();
        b.w64(b.kernel_dtb + 0x100 * 8, kernel_pdpt | PTE_FLAGS);
        b.w64(b.kernel_dtb + 0x1ed * 8, b.kernel_dtb | PTE_FLAGS);
        b
    }

    pub fn alloc_page(&mut self) -> u64 {
        let pa = self.next_page;
        self.next_page += PAGE;
        assert!((self.next_page as usize) <= IMAGE_SIZE, "image exhausted");
        pa
    }

    pub fn w8(&mut self, pa: u64, v: u8) {
        self.img[pa as usize] = v;
    }

    pub fn w16(&mut self, pa: u64, v: u16) {
        self.img[pa as usize..pa as usize + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn w32(&mut self, pa: u64, v: u32) {
        self.img[pa as usize..pa as usize + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn w64(&mut self, pa: u64, v: u64) {
        self.img[pa as usize..pa as usize + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn write(&mut self, pa: u64, data: &[u8]) {
        self.img[pa as usize..pa as usize + data.len()].copy_from_slice(data);
    }

    fn r64(&self, pa: u64) -> u64 {
        u64::from_le_bytes(self.img[pa as usize..pa as usize + 8].try_into().unwrap())
    }

    /// Create a process page table sharing the kernel half.
    pub fn new_process_dtb(&mut self) -> u64 {
        let dtb = self.alloc_page();
        let kernel_half = self.r64(self.kernel_dtb + 0x100 * 8);
        let self_ref = self.r64(self.kernel_dtb + 0x1ed * 8);
        self.w64(dtb + 0x100 * 8, kernel_half);
        self.w64(dtb + 0x1ed * 8, self_ref);
        dtb
    }

    /// Map one 4 KiB page, creating intermediate tables as needed.
    pub fn map(&mut self, dtb: u64, va: u64, pa: u64) {
        let idx4 = (va >> 39) & 0x1ff;
        let idx3 = (va >> 30) & 0x1ff;
        let idx2 = (va >> 21) & 0x1ff;
        let idx1 = (va >> 12) & 0x1ff;

        let pdpt = self.table_at(dtb + idx4 * 8);
        let pd = self.table_at(pdpt + idx3 * 8);
        let pt = self.table_at(pd + idx2 * 8);
        self.w64(pt + idx1 * 8, pa | PTE_FLAGS);
    }

    fn table_at(&mut self, entry_pa: u64) -> u64 {
        let e = self.r64(entry_pa);
        if e & 1 != 0 {
            return e & 0x000f_ffff_ffff_f000;
        }
        let table = self.alloc_page();
        self.w64(entry_pa, table | PTE_FLAGS);
        table
    }

    /// Map a fresh physical page at `va`, returning its physical address.
    pub fn map_new(&mut self, dtb: u64, va: u64) -> u64 {
        let pa = self.alloc_page();
        self.map(dtb, va, pa);
        pa
    }

    /// Kernel-space mapping through the shared kernel half.
    pub fn kmap_new(&mut self, va: u64) -> u64 {
        let kernel_dtb = self.kernel_dtb;
        let pa = self.alloc_page();
        self.map(kernel_dtb, va, pa);
        pa
    }
}

fn utf16(b: &mut ImageBuilder, pa: u64, s: &str) {
    let mut off = pa;
    for u in s.encode_utf16() {
        b.w16(off, u);
        off += 2;
    }
    b.w16(off, 0);
}

/// UNICODE_STRING at `pa` pointing to utf-16 text at `text_va`.
fn unicode_string(b: &mut ImageBuilder, pa: u64, text_va: u64, s: &str) {
    let bytes = (s.encode_utf16().count() * 2) as u16;
    b.w16(pa, bytes);
    b.w16(pa + 2, bytes + 2);
    b.w64(pa + 8, text_va);
}

pub struct TestImage {
    pub vmm: Arc<Vmm>,
    pub winlogon_eprocess: u64,
}

/// Assemble the guest and initialize a handle against it.
pub fn build(volatile: bool) -> TestImage {
    let mut b = ImageBuilder::new();
    let profile = test_profile();
    let eo = profile.eprocess;

    // kernel list head and the EPROCESS page
    let ps_head_pa = b.kmap_new(VA_PS_HEAD);
    let eproc_pa = b.kmap_new(VA_EPROC_PAGE);

    let sys_rec = VA_EPROC_PAGE + 0x100;
    let smss_rec = VA_EPROC_PAGE + 0x200;
    let winlogon_rec = VA_EPROC_PAGE + 0x300;
    let services_rec = VA_EPROC_PAGE + 0x400;
    let recs = [sys_rec, smss_rec, winlogon_rec, services_rec];

    // doubly linked ActiveProcessLinks ring through the head
    let links: Vec<u64> = recs.iter().map(|r| r + eo.active_process_links as u64).collect();
    b.w64(ps_head_pa, links[0]);
    b.w64(ps_head_pa + 8, links[3]);
    for (i, &link) in links.iter().enumerate() {
        let pa = eproc_pa + (link - VA_EPROC_PAGE);
        let flink = if i + 1 < links.len() { links[i + 1] } else { VA_PS_HEAD };
        let blink = if i > 0 { links[i - 1] } else { VA_PS_HEAD };
        b.w64(pa, flink);
        b.w64(pa + 8, blink);
    }

    // process address spaces
    let smss_dtb = b.new_process_dtb();
    let winlogon_dtb = b.new_process_dtb();
    let services_dtb = b.new_process_dtb();

    // token shared by everything in the image (SYSTEM)
    let va_token = KVA + 0x0021_0000;
    let token_pa = b.kmap_new(va_token);
    let va_sid_attr = va_token + 0x100;
    let va_sid = va_token + 0x200;
    b.w64(token_pa + 0x08, va_sid_attr);
    b.w64(token_pa + 0x100, va_sid);
    b.write(token_pa + 0x200, &[1, 1, 0, 0, 0, 0, 0, 5, 18, 0, 0, 0]);

    let eproc = |b: &mut ImageBuilder, rec: u64, pid: u32, ppid: u32, dtb: u64, peb: u64, name: &str| {
        let pa = eproc_pa + (rec - VA_EPROC_PAGE);
        b.w64(pa + eo.unique_process_id as u64, pid as u64);
        b.w64(pa + eo.inherited_from_pid as u64, ppid as u64);
        b.w64(pa + eo.dtb as u64, dtb);
        b.w64(pa + eo.peb as u64, peb);
        b.w64(pa + eo.token as u64, va_token);
        // empty thread list: points back at itself
        b.w64(pa + eo.thread_list_head as u64, rec + eo.thread_list_head as u64);
        b.w64(pa + eo.thread_list_head as u64 + 8, rec + eo.thread_list_head as u64);
        let mut raw = [0u8; 15];
        raw[..name.len().min(15)].copy_from_slice(&name.as_bytes()[..name.len().min(15)]);
        b.write(pa + eo.image_file_name as u64, &raw);
    };
    let kernel_dtb = b.kernel_dtb;
    eproc(&mut b, sys_rec, PID_SYSTEM, 0, kernel_dtb, 0, "System");
    eproc(&mut b, smss_rec, PID_SMSS, PID_SYSTEM, smss_dtb, 0x7ff7_1000_0000, "smss.exe");
    eproc(&mut b, winlogon_rec, PID_WINLOGON, PID_SMSS, winlogon_dtb, WINLOGON_PEB, "winlogon.exe");
    eproc(&mut b, services_rec, PID_SERVICES, PID_SMSS, services_dtb, 0x7ff7_2000_0000, "services.exe");

    // smss/services pebs: one zeroed page each so user_only holds
    b.map_new(smss_dtb, 0x7ff7_1000_0000);
    b.map_new(services_dtb, 0x7ff7_2000_0000);

    build_winlogon(&mut b, &profile, winlogon_dtb, winlogon_rec, eproc_pa);
    build_pool_and_net(&mut b, winlogon_rec);
    build_services(&mut b, services_dtb);

    let symbols = StaticSymbols::new(vec![
        ("nt".into(), "PsActiveProcessHead".into(), VA_PS_HEAD),
        ("nt".into(), "PoolBigPageTable".into(), VA_POOL_GLOBALS),
        ("nt".into(), "PoolBigPageTableSize".into(), VA_POOL_GLOBALS + 8),
        ("services".into(), "ServiceDatabase".into(), 0x0000_2000_0000),
    ]);

    let device = Arc::new(RamDevice::new(b.img, volatile));
    let mut args = VmmArgs::new(DeviceSpec::Device(device));
    args.dtb = Some(b.kernel_dtb);
    args.memory_model = Some(MemoryModel::X64);
    args.symbols = Some(Arc::new(symbols));
    args.offsets = Some(Arc::new(StaticOffsetDb::with_profile(profile)));
    args.no_refresh = true;

    let vmm = Vmm::initialize(args).expect("initialize against synthetic image");
    TestImage { vmm, winlogon_eprocess: winlogon_rec }
}

fn build_winlogon(
    b: &mut ImageBuilder,
    profile: &OffsetProfile,
    dtb: u64,
    rec: u64,
    eproc_pa: u64,
) {
    let lo = profile.ldr;
    let eo = profile.eprocess;
    let po = profile.peb;

    // PEB
    let peb_pa = b.map_new(dtb, WINLOGON_PEB);
    b.w64(peb_pa + po.image_base_address as u64, WINLOGON_BASE);

    // loader data + two modules
    let va_ldr = WINLOGON_PEB + 0x3000;
    let ldr_pa = b.map_new(dtb, va_ldr);
    b.w64(peb_pa + lo.peb_ldr as u64, va_ldr);
    let list_head = va_ldr + lo.in_load_order_list as u64;

    let va_mods = WINLOGON_PEB + 0x4000;
    let mods_pa = b.map_new(dtb, va_mods);
    let m1 = va_mods + 0x000; // winlogon.exe
    let m2 = va_mods + 0x100; // ntdll.dll
    b.w64(ldr_pa + lo.in_load_order_list as u64, m1);
    b.w64(ldr_pa + lo.in_load_order_list as u64 + 8, m2);

    let texts = va_mods + 0x800;
    let ldr_entry = |b: &mut ImageBuilder,
                         entry: u64,
                         flink: u64,
                         blink: u64,
                         base: u64,
                         size: u64,
                         full_off: u64,
                         full: &str,
                         name_off: u64,
                         name: &str| {
        let pa = mods_pa + (entry - va_mods);
        b.w64(pa, flink);
        b.w64(pa + 8, blink);
        b.w64(pa + lo.dll_base as u64, base);
        b.w64(pa + lo.entry_point as u64, base + 0x1234);
        b.w32(pa + lo.size_of_image as u64, size as u32);
        utf16(b, mods_pa + (texts - va_mods) + full_off, full);
        unicode_string(b, pa + lo.full_dll_name as u64, texts + full_off, full);
        utf16(b, mods_pa + (texts - va_mods) + name_off, name);
        unicode_string(b, pa + lo.base_dll_name as u64, texts + name_off, name);
    };
    ldr_entry(
        b,
        m1,
        m2,
        list_head,
        WINLOGON_BASE,
        0x20000,
        0x000,
        "C:\\Windows\\System32\\winlogon.exe",
        0x100,
        "winlogon.exe",
    );
    ldr_entry(
        b,
        m2,
        list_head,
        m1,
        NTDLL_BASE,
        0x1f0000,
        0x180,
        "C:\\Windows\\System32\\ntdll.dll",
        0x280,
        "ntdll.dll",
    );

    // PE headers for both images
    for base in [WINLOGON_BASE, NTDLL_BASE] {
        let pa = b.map_new(dtb, base);
        b.write(pa, b"MZ\x90\x00");
        b.w32(pa + 0x3c, 0x80);
        b.write(pa + 0x80, b"PE\0\0");
        b.w16(pa + 0x86, 3); // sections
        b.w16(pa + 0x98, 0x20b); // PE32+
        let dirs = 0x80 + 0x18 + 0x70;
        b.w32(pa + dirs, 0x1000); // export rva
        b.w32(pa + dirs + 4, 0x100);
        b.w32(pa + dirs + 8, 0x2000); // import rva
        b.w32(pa + dirs + 12, 100); // 5 descriptors
        let exp_pa = b.map_new(dtb, base + 0x1000);
        b.w32(exp_pa + 0x14, 7); // NumberOfFunctions
        b.map_new(dtb, base + 0x2000);
    }

    // threads: two ETHREADs in one kernel page
    let va_threads = KVA + 0x0022_0000;
    let thr_pa = b.kmap_new(va_threads);
    let to = profile.ethread;
    let t1 = va_threads + 0x000;
    let t2 = va_threads + 0x100;
    let head = rec + eo.thread_list_head as u64;
    let head_pa = eproc_pa + (head - VA_EPROC_PAGE);
    b.w64(head_pa, t1 + to.thread_list_entry as u64);
    b.w64(head_pa + 8, t2 + to.thread_list_entry as u64);
    let ethread = |b: &mut ImageBuilder, va: u64, flink: u64, blink: u64, tid: u64| {
        let pa = thr_pa + (va - va_threads);
        b.w64(pa + to.thread_list_entry as u64, flink);
        b.w64(pa + to.thread_list_entry as u64 + 8, blink);
        b.w64(pa + to.cid_unique_thread as u64, tid);
        b.w64(pa + to.teb as u64, 0x7ff7_0000_4000);
        b.w64(pa + to.start_address as u64, NTDLL_BASE + 0x5000);
        b.w64(pa + to.win32_start_address as u64, WINLOGON_BASE + 0x1234);
        b.w8(pa + to.priority as u64, 8);
        b.w8(pa + to.state as u64, 5); // waiting
    };
    ethread(b, t1, t2, head, 0x21c);
    ethread(b, t2, head, t1, 0x220);

    // VAD tree: root = winlogon image, left = ntdll image (with backing
    // file), right = private heap region
    let va_vads = KVA + 0x0022_1000;
    let vad_pa = b.kmap_new(va_vads);
    let vo = profile.vad;
    let root = va_vads + 0x000;
    let left = va_vads + 0x100;
    let right = va_vads + 0x200;
    b.w64(eproc_pa + (rec - VA_EPROC_PAGE) + eo.vad_root as u64, root);

    let heap1 = 0x0000_0000_2000_0000u64;
    let vad = |b: &mut ImageBuilder, va: u64, l: u64, r: u64, start: u64, end: u64, flags: u32, subsection: u64| {
        let pa = vad_pa + (va - va_vads);
        b.w64(pa + vo.node_left as u64, l);
        b.w64(pa + vo.node_right as u64, r);
        b.w32(pa + vo.starting_vpn as u64, (start >> 12) as u32);
        b.w32(pa + vo.ending_vpn as u64, (end >> 12) as u32);
        b.w8(pa + vo.starting_vpn_high as u64, (start >> 44) as u8);
        b.w8(pa + vo.ending_vpn_high as u64, (end >> 44) as u8);
        b.w32(pa + vo.flags as u64, flags);
        b.w64(pa + vo.subsection as u64, subsection);
    };

    // file object chain for the ntdll VAD
    let va_file = KVA + 0x0022_2000;
    let file_pa = b.kmap_new(va_file);
    let fo = profile.file_ref;
    let subsection = va_file + 0x000;
    let control_area = va_file + 0x100;
    let file_object = va_file + 0x200;
    let file_text = va_file + 0x400;
    b.w64(file_pa + (subsection - va_file) + fo.subsection_control_area as u64, control_area);
    // low flag bits on the file pointer must be masked by the reader
    b.w64(file_pa + (control_area - va_file) + fo.control_area_file_pointer as u64, file_object | 0x7);
    utf16(b, file_pa + (file_text - va_file), "\\Windows\\System32\\ntdll.dll");
    unicode_string(
        b,
        file_pa + (file_object - va_file) + fo.file_object_file_name as u64,
        file_text,
        "\\Windows\\System32\\ntdll.dll",
    );

    let img_flags = 2 | (5 << 3); // image, execute_writecopy
    let priv_flags = (4 << 3) | (1 << 20); // readwrite, private
    vad(b, root, left, right, WINLOGON_BASE, WINLOGON_BASE + 0x1ffff, img_flags, 0);
    vad(b, left, 0, 0, NTDLL_BASE, NTDLL_BASE + 0x1effff, img_flags, subsection);
    vad(b, right, 0, 0, heap1, heap1 + 0xffff, priv_flags, 0);

    // heaps: count + pointer array in the PEB page
    let va_heap_array = WINLOGON_PEB + 0x5000;
    let ha_pa = b.map_new(dtb, va_heap_array);
    b.w32(peb_pa + po.number_of_heaps as u64, 2);
    b.w64(peb_pa + po.process_heaps as u64, va_heap_array);
    b.w64(ha_pa, heap1);
    b.w64(ha_pa + 8, heap1 + 0x10000);
    b.map_new(dtb, heap1);

    // handle table: level 0, two entries
    let va_ht = KVA + 0x0022_3000;
    let ht_pa = b.kmap_new(va_ht);
    let va_l0 = KVA + 0x0022_4000;
    let l0_pa = b.kmap_new(va_l0);
    b.w64(
        eproc_pa + (rec - VA_EPROC_PAGE) + eo.object_table as u64,
        va_ht,
    );
    b.w64(ht_pa + profile.handle_table.table_code as u64, va_l0); // level 0
    let obj1 = KVA + 0x0022_5040;
    let obj2 = KVA + 0x0022_5180;
    b.kmap_new(KVA + 0x0022_5000);
    let encode = |va: u64| ((va & 0x0000_ffff_ffff_ffff) >> 4) << 20;
    b.w64(l0_pa + 1 * 16, encode(obj1));
    b.w64(l0_pa + 1 * 16 + 8, 0x1f_ffff);
    b.w64(l0_pa + 2 * 16, encode(obj2));
    b.w64(l0_pa + 2 * 16 + 8, 0x12_0089);

    // search region: aligned and unaligned pattern hits
    for (i, page_va) in [SEARCH_REGION, SEARCH_REGION + 0x1000, SEARCH_REGION + 0x2000]
        .into_iter()
        .enumerate()
    {
        let pa = b.map_new(dtb, page_va);
        if i < 2 {
            b.write(pa, b"\x4d\x5a\x90\x00");
        }
        if i == 2 {
            b.write(pa + 0x300, b"\x4d\x5a\x90\x00");
        }
    }
}

fn build_pool_and_net(b: &mut ImageBuilder, winlogon_rec: u64) {
    // pool globals page: table pointer + count
    let globals_pa = b.kmap_new(VA_POOL_GLOBALS);
    let va_table = VA_POOL_GLOBALS + 0x100;
    b.w64(globals_pa, va_table);
    b.w64(globals_pa + 8, 3);

    // endpoints page
    let va_tcp = KVA + 0x0023_0000;
    let tcp_pa = b.kmap_new(va_tcp);
    let ep1 = va_tcp + 0x000;
    let ep2 = va_tcp + 0x100;
    let endpoint = |b: &mut ImageBuilder, va: u64, state: u32, lport: u16, rport: u16| {
        let pa = tcp_pa + (va - va_tcp);
        b.w32(pa + 0x6c, state);
        b.write(pa + 0x70, &[10, 0, 0, 5]); // local 10.0.0.5
        b.write(pa + 0x74, &lport.to_be_bytes());
        b.write(pa + 0x78, &[93, 184, 216, 34]); // remote
        b.write(pa + 0x7c, &rport.to_be_bytes());
        b.w64(pa + 0x80, winlogon_rec);
    };
    endpoint(b, ep1, 5, 49152, 443); // established
    endpoint(b, ep2, 2, 135, 0); // listening

    // big pool records: two TcpE plus one unrelated tag
    let table_pa = globals_pa + 0x100;
    let record = |b: &mut ImageBuilder, idx: u64, va: u64, tag: &[u8; 4], size: u64| {
        let pa = table_pa + idx * 0x18;
        b.w64(pa, va);
        b.write(pa + 8, tag);
        b.w64(pa + 0x10, size);
    };
    record(b, 0, ep1, b"TcpE", 0x100);
    record(b, 1, ep2, b"TcpE", 0x100);
    record(b, 2, KVA + 0x0023_1000, b"Proc", 0x800);
}

fn build_services(b: &mut ImageBuilder, dtb: u64) {
    let va_db = 0x0000_2000_0000u64;
    let db_pa = b.map_new(dtb, va_db);
    let rec1 = va_db + 0x100;
    let rec2 = va_db + 0x200;
    let text = va_db + 0x800;

    // head ring
    b.w64(db_pa, rec1);
    b.w64(db_pa + 8, rec2);

    let service = |b: &mut ImageBuilder,
                       rec: u64,
                       flink: u64,
                       blink: u64,
                       ordinal: u32,
                       name_off: u64,
                       name: &str,
                       disp_off: u64,
                       display: &str,
                       state: u32,
                       pid: u32| {
        let pa = db_pa + (rec - va_db);
        b.w64(pa, flink);
        b.w64(pa + 8, blink);
        b.w32(pa + 0x10, ordinal);
        b.w64(pa + 0x18, text + name_off);
        b.w64(pa + 0x20, text + disp_off);
        b.w32(pa + 0x28, state);
        b.w32(pa + 0x2c, pid);
        utf16(b, db_pa + (text - va_db) + name_off, name);
        utf16(b, db_pa + (text - va_db) + disp_off, display);
    };
    service(b, rec1, rec2, va_db, 1, 0x00, "Dhcp", 0x40, "DHCP Client", 4, 900);
    service(b, rec2, va_db, rec1, 2, 0x100, "EventLog", 0x140, "Windows Event Log", 4, 901);
}
