//! Symbol resolution and static offset database contracts.
//!
//! Kernel reconstruction needs per-build structure offsets and a handful of
//! global symbol addresses. Both come from outside the core: a symbol
//! provider (PDB-backed in a full deployment) and a static offset database.
//! A built-in database ships the offsets of the supported 64-bit layout
//! family so the engine works without any symbol backend attached.

/// Symbol queries, answered by an external backend ("nt", "ntoskrnl" and
/// "tcpip" are the module names used by the core).
pub trait SymbolProvider: Send + Sync {
    /// Virtual address of a global symbol.
    fn symbol_va(&self, module: &str, symbol: &str) -> Option<u64>;

    /// Offset of a symbol relative to its module base.
    fn symbol_offset(&self, module: &str, symbol: &str) -> Option<u32>;

    /// Nearest preceding symbol of an address plus displacement.
    fn symbol_nearest(&self, module: &str, va: u64) -> Option<(String, u64)>;

    fn type_size(&self, module: &str, type_name: &str) -> Option<u32>;

    fn type_child_offset(&self, module: &str, type_name: &str, child: &str) -> Option<u32>;
}

/// A backend with no answers. Discovery then relies on the offset profile
/// and physical scanning alone.
pub struct NullSymbols;

impl SymbolProvider for NullSymbols {
    fn symbol_va(&self, _: &str, _: &str) -> Option<u64> {
        None
    }

    fn symbol_offset(&self, _: &str, _: &str) -> Option<u32> {
        None
    }

    fn symbol_nearest(&self, _: &str, _: u64) -> Option<(String, u64)> {
        None
    }

    fn type_size(&self, _: &str, _: &str) -> Option<u32> {
        None
    }

    fn type_child_offset(&self, _: &str, _: &str, _: &str) -> Option<u32> {
        None
    }
}

//
// Per-variant offset tables. One flat profile per supported guest layout;
// a field value of zero means "not present in this layout".
//

#[derive(Debug, Clone, Copy)]
pub struct EprocessOffsets {
    pub unique_process_id: u32,
    pub active_process_links: u32,
    pub inherited_from_pid: u32,
    pub image_file_name: u32,
    pub dtb: u32,
    pub dtb_user: u32,
    pub peb: u32,
    pub wow64_process: u32,
    pub session: u32,
    pub token: u32,
    pub thread_list_head: u32,
    pub vad_root: u32,
    pub object_table: u32,
    /// Bytes of one record fetched per process.
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct EthreadOffsets {
    pub thread_list_entry: u32,
    pub cid_unique_thread: u32,
    pub teb: u32,
    pub start_address: u32,
    pub win32_start_address: u32,
    pub priority: u32,
    pub state: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct LdrOffsets {
    /// PEB.Ldr
    pub peb_ldr: u32,
    /// PEB_LDR_DATA.InLoadOrderModuleList
    pub in_load_order_list: u32,
    // _LDR_DATA_TABLE_ENTRY fields (InLoadOrderLinks at offset 0):
    pub dll_base: u32,
    pub entry_point: u32,
    pub size_of_image: u32,
    pub full_dll_name: u32,
    pub base_dll_name: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct VadOffsets {
    // _MMVAD_SHORT layout
    pub node_left: u32,
    pub node_right: u32,
    pub starting_vpn: u32,
    pub ending_vpn: u32,
    pub starting_vpn_high: u32,
    pub ending_vpn_high: u32,
    pub flags: u32,
    /// _MMVAD.Subsection (only valid past the short VAD size).
    pub subsection: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PebOffsets {
    pub image_base_address: u32,
    pub number_of_heaps: u32,
    pub process_heaps: u32,
    pub being_debugged: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct HandleTableOffsets {
    /// _HANDLE_TABLE.TableCode
    pub table_code: u32,
    /// _HANDLE_TABLE_ENTRY size (16 on the supported 64-bit layouts).
    pub entry_size: u32,
}

/// Chain from a mapped VAD to its backing file name:
/// subsection -> control area -> file object -> UNICODE_STRING.
#[derive(Debug, Clone, Copy)]
pub struct FileRefOffsets {
    pub subsection_control_area: u32,
    pub control_area_file_pointer: u32,
    pub file_object_file_name: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenOffsets {
    /// _TOKEN.UserAndGroups (pointer to _SID_AND_ATTRIBUTES array).
    pub user_and_groups: u32,
}

/// _POOL_TRACKER_BIG_PAGES record layout.
#[derive(Debug, Clone, Copy)]
pub struct PoolOffsets {
    pub entry_size: u32,
    pub va: u32,
    pub key: u32,
    pub bytes: u32,
}

/// Compact `_TCP_ENDPOINT` layout used by the network view pool scan.
#[derive(Debug, Clone, Copy)]
pub struct TcpEndpointOffsets {
    pub state: u32,
    pub local_addr: u32,
    pub local_port: u32,
    pub remote_addr: u32,
    pub remote_port: u32,
    pub owning_process: u32,
    pub size: u32,
}

/// Service control manager record layout inside services.exe.
#[derive(Debug, Clone, Copy)]
pub struct ServiceOffsets {
    pub list_entry: u32,
    pub ordinal: u32,
    pub name_ptr: u32,
    pub display_ptr: u32,
    pub state: u32,
    pub pid: u32,
    pub size: u32,
}

/// All offsets of one guest layout plus identity metadata.
#[derive(Debug, Clone, Copy)]
pub struct OffsetProfile {
    pub build: u32,
    pub is_64: bool,
    pub eprocess: EprocessOffsets,
    pub ethread: EthreadOffsets,
    pub ldr: LdrOffsets,
    pub vad: VadOffsets,
    pub peb: PebOffsets,
    pub handle_table: HandleTableOffsets,
    pub file_ref: FileRefOffsets,
    pub token: TokenOffsets,
    pub pool: PoolOffsets,
    pub tcp: TcpEndpointOffsets,
    pub service: ServiceOffsets,
}

/// Read-only offset/identity database.
pub trait OffsetDb: Send + Sync {
    fn profile(&self) -> &OffsetProfile;

    /// Well-known SID to (user, domain).
    fn well_known_sid(&self, sid: &str) -> Option<(&'static str, &'static str)> {
        match sid {
            "S-1-5-18" => Some(("SYSTEM", "NT AUTHORITY")),
            "S-1-5-19" => Some(("LOCAL SERVICE", "NT AUTHORITY")),
            "S-1-5-20" => Some(("NETWORK SERVICE", "NT AUTHORITY")),
            "S-1-5-32-544" => Some(("Administrators", "BUILTIN")),
            "S-1-5-32-545" => Some(("Users", "BUILTIN")),
            _ => None,
        }
    }
}

/// Built-in profile of the supported 64-bit layout family (10.0.19041).
pub struct StaticOffsetDb {
    profile: OffsetProfile,
}

impl Default for StaticOffsetDb {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticOffsetDb {
    pub fn new() -> Self {
        Self {
            profile: OffsetProfile {
                build: 19041,
                is_64: true,
                eprocess: EprocessOffsets {
                    unique_process_id: 0x440,
                    active_process_links: 0x448,
                    inherited_from_pid: 0x540,
                    image_file_name: 0x5a8,
                    dtb: 0x28,
                    dtb_user: 0x388,
                    peb: 0x550,
                    wow64_process: 0x580,
                    session: 0x558,
                    token: 0x4b8,
                    thread_list_head: 0x5e0,
                    vad_root: 0x7d8,
                    object_table: 0x570,
                    size: 0x880,
                },
                ethread: EthreadOffsets {
                    thread_list_entry: 0x4e8,
                    cid_unique_thread: 0x490,
                    teb: 0xf0,
                    start_address: 0x450,
                    win32_start_address: 0x4d0,
                    priority: 0xc3,
                    state: 0x98,
                    size: 0x500,
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
                token: TokenOffsets { user_and_groups: 0x98 },
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
            },
        }
    }

    pub fn with_profile(profile: OffsetProfile) -> Self {
        Self { profile }
    }
}

impl OffsetDb for StaticOffsetDb {
    fn profile(&self) -> &OffsetProfile {
        &self.profile
    }
}

/// Fixed symbol table, useful when an embedder already knows the handful of
/// kernel globals the core wants.
pub struct StaticSymbols {
    symbols: Vec<(String, String, u64)>,
}

impl StaticSymbols {
    pub fn new(symbols: Vec<(String, String, u64)>) -> Self {
        Self { symbols }
    }
}

impl SymbolProvider for StaticSymbols {
    fn symbol_va(&self, module: &str, symbol: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find(|(m, s, _)| m == module && s == symbol)
            .map(|(_, _, va)| *va)
    }

    fn symbol_offset(&self, _: &str, _: &str) -> Option<u32> {
        None
    }

    fn symbol_nearest(&self, module: &str, va: u64) -> Option<(String, u64)> {
        self.symbols
            .iter()
            .filter(|(m, _, sva)| m == module && *sva <= va)
            .max_by_key(|(_, _, sva)| *sva)
            .map(|(_, s, sva)| (s.clone(), va - sva))
    }

    fn type_size(&self, _: &str, _: &str) -> Option<u32> {
        None
    }

    fn type_child_offset(&self, _: &str, _: &str, _: &str) -> Option<u32> {
        None
    }
}
