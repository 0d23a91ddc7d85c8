//! Read-only host for a live Linux process.
//!
//! Memory is read with `process_vm_readv`, layout comes from `/proc/<pid>/maps`.
//! Hardware breakpoints and memory-access watches need a hypervisor or a tracer and
//! are reported as unsupported.

use crate::host::disasm::{self, MAX_INSTRUCTION_LEN};
use crate::muted_error;
use crate::provider::{
    BreakTrigger, BytePattern, Instruction, IntrospectionProvider, MemoryRegion, ModuleInfo,
    ProcessInfo, ProtectionFilter, ProviderError, RegionProtection, ScanCriteria, ScanHandle,
    ScanResults, ThreadInfo, TrapHandler, WatchEntry, WatchId, WatchMode, WatchOptions,
};
use indexmap::IndexMap;
use nix::errno::Errno;
use nix::sys::uio::{self, RemoteIoVec};
use nix::unistd::Pid;
use proc_maps::MapRange;
use std::fs;
use std::io::{IoSliceMut, Read, Seek, SeekFrom};
use std::path::PathBuf;

const PAGE_SIZE: u64 = 4096;
/// Regions are scanned in chunks of this size.
const SCAN_CHUNK: usize = 1024 * 1024;
/// Largest single `process_vm_readv` transfer.
const MAX_REMOTE_READ: usize = 64 * 1024 * 1024;

pub struct ProcfsProvider {
    pid: Pid,
    is_64bit: bool,
    scans: IndexMap<ScanHandle, Vec<u64>>,
    next_scan: u64,
}

impl ProcfsProvider {
    pub fn attach(pid: i32) -> Result<Self, ProviderError> {
        let pid = Pid::from_raw(pid);
        let mut header = [0u8; 5];
        fs::File::open(proc_path(pid, "exe"))?.read_exact(&mut header)?;
        // EI_CLASS: 1 = ELFCLASS32, 2 = ELFCLASS64
        let is_64bit = header[..4] == *b"\x7fELF" && header[4] == 2;

        Ok(Self {
            pid,
            is_64bit,
            scans: IndexMap::new(),
            next_scan: 0,
        })
    }

    fn maps(&self) -> Result<Vec<MapRange>, ProviderError> {
        Ok(proc_maps::get_process_maps(self.pid.as_raw())?)
    }

    fn scan_regions(&mut self, pattern: &BytePattern, filter: &ProtectionFilter) -> Result<ScanHandle, ProviderError> {
        let overlap = pattern.len().saturating_sub(1);
        let mut addresses = vec![];

        for region in self.enumerate_regions()? {
            if !filter.admits(&region.protection) {
                continue;
            }
            let end = region.base + region.size;
            let mut chunk_start = region.base;
            while chunk_start < end {
                let len = ((end - chunk_start) as usize).min(SCAN_CHUNK + overlap);
                let Some(chunk) = muted_error!(self.read_bytes(chunk_start, len), "scan read:")
                else {
                    break;
                };
                addresses.extend(pattern.find_all(&chunk).map(|off| chunk_start + off as u64));
                chunk_start += SCAN_CHUNK as u64;
            }
        }

        // chunk overlap may report the same match twice
        addresses.dedup();
        self.next_scan += 1;
        let handle = ScanHandle(self.next_scan);
        self.scans.insert(handle, addresses);
        Ok(handle)
    }
}

fn proc_path(pid: Pid, entry: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/{entry}"))
}

fn is_file_backed(map: &MapRange) -> bool {
    map.filename()
        .is_some_and(|path| path.is_absolute())
}

impl IntrospectionProvider for ProcfsProvider {
    fn process_info(&self) -> Result<ProcessInfo, ProviderError> {
        let name = fs::read_to_string(proc_path(self.pid, "comm"))?;
        Ok(ProcessInfo {
            pid: self.pid.as_raw() as u32,
            name: name.trim().to_string(),
            is_64bit: self.is_64bit,
        })
    }

    fn pointer_size(&self) -> usize {
        if self.is_64bit {
            8
        } else {
            4
        }
    }

    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>, ProviderError> {
        if size > MAX_REMOTE_READ {
            return Err(ProviderError::ReadTooLarge(address, size));
        }
        let mut buf = vec![0u8; size];
        let remote = RemoteIoVec {
            base: address as usize,
            len: size,
        };
        let read = uio::process_vm_readv(self.pid, &mut [IoSliceMut::new(&mut buf)], &[remote])
            .map_err(|e| match e {
                Errno::EFAULT | Errno::EIO => ProviderError::Unreadable(address),
                e => ProviderError::Syscall("process_vm_readv", e),
            })?;
        if read < size {
            return Err(ProviderError::Unreadable(address));
        }
        Ok(buf)
    }

    fn disassemble_one(&self, address: u64) -> Result<Instruction, ProviderError> {
        // don't cross into a possibly unmapped page
        let to_page_end = (PAGE_SIZE - address % PAGE_SIZE) as usize;
        let code = match self.read_bytes(address, MAX_INSTRUCTION_LEN) {
            Ok(code) => code,
            Err(_) => self.read_bytes(address, to_page_end.min(MAX_INSTRUCTION_LEN))?,
        };
        disasm::disassemble_one(&code, address, self.is_64bit)
    }

    fn scan_pattern(
        &mut self,
        pattern: &BytePattern,
        filter: &ProtectionFilter,
    ) -> Result<ScanHandle, ProviderError> {
        self.scan_regions(pattern, filter)
    }

    fn scan_value(&mut self, criteria: &ScanCriteria) -> Result<ScanHandle, ProviderError> {
        self.scan_regions(&criteria.to_pattern(), &criteria.protection)
    }

    fn enumerate_results(&self, handle: ScanHandle, max: usize) -> Result<ScanResults, ProviderError> {
        let addresses = self
            .scans
            .get(&handle)
            .ok_or(ProviderError::UnknownScan(handle))?;
        Ok(ScanResults {
            total: addresses.len(),
            addresses: addresses.iter().take(max).copied().collect(),
        })
    }

    fn release_scan(&mut self, handle: ScanHandle) -> Result<(), ProviderError> {
        self.scans
            .shift_remove(&handle)
            .map(|_| ())
            .ok_or(ProviderError::UnknownScan(handle))
    }

    fn resolve_symbol(&self, name: &str) -> Result<u64, ProviderError> {
        self.enumerate_modules()?
            .into_iter()
            .find(|m| m.name == name)
            .map(|m| m.base)
            .ok_or_else(|| ProviderError::SymbolNotFound(name.to_string()))
    }

    fn enumerate_modules(&self) -> Result<Vec<ModuleInfo>, ProviderError> {
        let mut modules: IndexMap<PathBuf, (u64, u64)> = IndexMap::new();
        for map in self.maps()?.iter().filter(|m| is_file_backed(m)) {
            let Some(path) = map.filename() else {
                continue;
            };
            let start = map.start() as u64;
            let end = start + map.size() as u64;
            let bounds = modules.entry(path.to_path_buf()).or_insert((start, end));
            bounds.0 = bounds.0.min(start);
            bounds.1 = bounds.1.max(end);
        }

        Ok(modules
            .into_iter()
            .map(|(path, (start, end))| ModuleInfo {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                base: start,
                size: end - start,
                path: Some(path.to_string_lossy().into_owned()),
            })
            .collect())
    }

    fn enumerate_threads(&self) -> Result<Vec<ThreadInfo>, ProviderError> {
        let mut threads = vec![];
        for entry in fs::read_dir(proc_path(self.pid, "task"))? {
            let entry = entry?;
            let Some(id) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            let name = muted_error!(fs::read_to_string(entry.path().join("comm")))
                .map(|n| n.trim().to_string());
            threads.push(ThreadInfo { id, name });
        }
        threads.sort_by_key(|t| t.id);
        Ok(threads)
    }

    fn enumerate_regions(&self) -> Result<Vec<MemoryRegion>, ProviderError> {
        Ok(self
            .maps()?
            .iter()
            .map(|map| MemoryRegion {
                base: map.start() as u64,
                size: map.size() as u64,
                protection: RegionProtection {
                    read: map.is_read(),
                    write: map.is_write(),
                    execute: map.is_exec(),
                    // writable private file mappings are copy-on-write
                    copy_on_write: map.is_write() && is_file_backed(map),
                },
                path: map.filename().map(|p| p.to_string_lossy().into_owned()),
            })
            .collect())
    }

    fn set_hardware_breakpoint(
        &mut self,
        _: u64,
        _: usize,
        _: BreakTrigger,
        _: TrapHandler,
    ) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("hardware breakpoint"))
    }

    fn remove_breakpoint(&mut self, address: u64) -> Result<(), ProviderError> {
        Err(ProviderError::NoBreakpoint(address))
    }

    /// Translate through `/proc/<pid>/pagemap`, needs `CAP_SYS_ADMIN` to see frame numbers.
    fn resolve_physical_address(&self, address: u64) -> Result<u64, ProviderError> {
        let mut pagemap = fs::File::open(proc_path(self.pid, "pagemap"))?;
        pagemap.seek(SeekFrom::Start((address / PAGE_SIZE) * 8))?;
        let mut entry = [0u8; 8];
        pagemap.read_exact(&mut entry)?;
        physical_from_pagemap(u64::from_le_bytes(entry), address)
            .ok_or(ProviderError::PhysicalResolution(address))
    }

    fn start_watch(&mut self, _: u64, _: WatchMode, _: WatchOptions) -> Result<WatchId, ProviderError> {
        Err(ProviderError::Unsupported("memory access watch"))
    }

    fn retrieve_watch_log(&mut self, id: WatchId) -> Result<Vec<WatchEntry>, ProviderError> {
        Err(ProviderError::UnknownWatch(id))
    }

    fn disable_watch(&mut self, id: WatchId) -> Result<(), ProviderError> {
        Err(ProviderError::UnknownWatch(id))
    }
}

/// Physical address from a pagemap entry, `None` for absent pages and hidden frame numbers.
fn physical_from_pagemap(entry: u64, address: u64) -> Option<u64> {
    let present = entry & (1 << 63) != 0;
    let pfn = entry & ((1 << 55) - 1);
    if !present || pfn == 0 {
        return None;
    }
    pfn.checked_mul(PAGE_SIZE)?.checked_add(address % PAGE_SIZE)
}
