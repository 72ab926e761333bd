//! Analyst command line client: open a memory dump, query the engine.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use vmcore::mem::search::SearchTerm;
use vmcore::{DeviceSpec, MemoryModel, ReadFlags, Vmm, VmmArgs};

#[derive(Parser)]
#[command(name = "vmctl", about = "Query a physical memory image")]
struct Cli {
    /// Raw memory dump file.
    #[arg(long, global = true)]
    device: Option<PathBuf>,

    /// Kernel directory table base (hex), scanned for when omitted.
    #[arg(long, value_parser = parse_hex, global = true)]
    dtb: Option<u64>,

    /// Paging variant: x64, x86 or pae.
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List processes.
    Ps,
    /// Read process virtual memory and hex-dump it.
    Read {
        #[arg(long)]
        pid: u32,
        #[arg(long, value_parser = parse_hex)]
        va: u64,
        #[arg(long, default_value_t = 0x100)]
        len: usize,
    },
    /// List the loaded modules of a process.
    Modules {
        #[arg(long)]
        pid: u32,
    },
    /// Search process memory for a hex pattern.
    Search {
        #[arg(long)]
        pid: u32,
        #[arg(long)]
        hex: String,
        #[arg(long, default_value_t = 1)]
        align: u32,
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        min: u64,
        #[arg(long, value_parser = parse_hex, default_value = "7fffffffffff")]
        max: u64,
    },
    /// List a path on the plugin surface.
    Ls { path: String },
    /// Read a file on the plugin surface.
    Cat { path: String },
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| e.to_string())
}

fn parse_model(s: &str) -> Option<MemoryModel> {
    match s.to_ascii_lowercase().as_str() {
        "x64" => Some(MemoryModel::X64),
        "x86" => Some(MemoryModel::X86),
        "pae" | "x86pae" => Some(MemoryModel::X86Pae),
        _ => None,
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let Some(device) = cli.device.clone() else {
        log::error!("--device is required");
        return ExitCode::FAILURE;
    };
    let mut args = VmmArgs::new(DeviceSpec::DumpFile(device));
    args.dtb = cli.dtb;
    args.memory_model = cli.model.as_deref().and_then(parse_model);
    args.no_refresh = true;

    let vmm = match Vmm::initialize(args) {
        Ok(v) => v,
        Err(e) => {
            log::error!("initialize failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = run(&vmm, &cli.cmd);
    vmm.close();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(vmm: &Arc<Vmm>, cmd: &Cmd) -> Result<(), vmcore::VmmError> {
    match cmd {
        Cmd::Ps => {
            println!("{:>6} {:>6} {:<16} {:>4} {:>18}", "PID", "PPID", "NAME", "WOW", "EPROCESS");
            for p in vmm.process_list()? {
                println!(
                    "{:>6} {:>6} {:<16} {:>4} {:>#18x}",
                    p.pid,
                    p.ppid,
                    p.name,
                    if p.win.is_wow64 { "y" } else { "-" },
                    p.win.va_eprocess
                );
            }
        }
        Cmd::Read { pid, va, len } => {
            let mut buf = vec![0u8; *len];
            vmm.mem_read(Some(*pid), *va, &mut buf, ReadFlags::ZEROPAD)?;
            hexdump(*va, &buf);
        }
        Cmd::Modules { pid } => {
            let map = vmm.map_module(*pid)?;
            println!("{:>18} {:>10} {:<24} PATH", "BASE", "SIZE", "NAME");
            for m in &map.entries {
                println!(
                    "{:>#18x} {:>#10x} {:<24} {}",
                    m.base,
                    m.image_size,
                    m.name.get(&map.pool),
                    m.full_path.get(&map.pool)
                );
            }
        }
        Cmd::Search { pid, hex, align, min, max } => {
            let pattern = vmcore::util::hexascii_to_bytes(hex)
                .ok_or(vmcore::VmmError::InvalidParameter { reason: "bad hex pattern" })?;
            let term = SearchTerm { pattern, skip_mask: Vec::new(), align: *align };
            let hits = vmm.mem_search(*pid, term, *min, *max)?;
            for h in &hits {
                println!("{:#018x}", h);
            }
            log::info!("{} hits", hits.len());
        }
        Cmd::Ls { path } => {
            for e in vmm.vfs_list(path)? {
                if e.is_dir {
                    println!("{:>10} {}/", "", e.name);
                } else {
                    println!("{:>10} {}", e.size, e.name);
                }
            }
        }
        Cmd::Cat { path } => {
            let mut buf = vec![0u8; 0x10000];
            let (n, status) = vmm.vfs_read(path, &mut buf, 0);
            if n == 0 && status != vmcore::ExtStatus::Success {
                return Err(vmcore::VmmError::InvalidPath);
            }
            print!("{}", String::from_utf8_lossy(&buf[..n]));
        }
    }
    Ok(())
}

fn hexdump(base: u64, data: &[u8]) {
    for (i, chunk) in data.chunks(16).enumerate() {
        let ascii: String = chunk
            .iter()
            .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
            .collect();
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:016x}  {:<47}  {}", base + (i as u64) * 16, hex.join(" "), ascii);
    }
}
