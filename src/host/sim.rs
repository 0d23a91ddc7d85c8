//! Deterministic in-memory introspection host.
//!
//! [`SimulatedProvider`] models a small 64-bit target: a code image, a heap-like data region
//! and a stack, with modules, threads and symbols on top. Hardware breakpoints and memory
//! watches are tracked like a real host would, traps and accesses are injected with
//! [`SimulatedProvider::fire`] and [`SimulatedProvider::touch`].
//!
//! The provider is cheaply cloneable, clones share the same target. This lets a test keep a
//! handle to the target while the bridge owns the provider.

use crate::host::disasm::{self, MAX_INSTRUCTION_LEN};
use crate::provider::{
    BreakTrigger, BytePattern, Instruction, IntrospectionProvider, MemoryRegion, ModuleInfo,
    ProcessInfo, ProtectionFilter, ProviderError, RegionProtection, RegisterSnapshot,
    ScanCriteria, ScanHandle, ScanResults, ThreadInfo, TrapContext, TrapHandler, WatchEntry,
    WatchId, WatchMode, WatchOptions,
};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Offset between simulated virtual and physical addresses.
pub const PHYSICAL_OFFSET: u64 = 0x1_0000_0000;
/// Watches observe accesses with this granularity.
const WATCH_GRANULE: u64 = 8;

pub const IMAGE_BASE: u64 = 0x400000;
pub const CODE_ADDRESS: u64 = 0x401000;
pub const UPDATE_PLAYER_ADDRESS: u64 = 0x401100;
pub const DATA_ADDRESS: u64 = 0x500000;
pub const STACK_BASE: u64 = 0x7ffe0000;
const STACK_POINTER: u64 = STACK_BASE + 0x800;

/// `sub_401000` of the default target.
const CODE: &[u8] = &[
    0x48, 0x89, 0x5c, 0x24, 0x08, // mov qword ptr [rsp + 8], rbx
    0x48, 0x83, 0xec, 0x20, // sub rsp, 0x20
    0x8b, 0x05, 0x31, 0xf0, 0x0f, 0x00, // mov eax, dword ptr [rip + 0xff031]
    0xff, 0xc0, // inc eax
    0x89, 0x05, 0x29, 0xf0, 0x0f, 0x00, // mov dword ptr [rip + 0xff029], eax
    0x48, 0x83, 0xc4, 0x20, // add rsp, 0x20
    0xc3, // ret
];

/// `update_player`, calls `main` and then through a pointer loaded from `player_health`.
const UPDATE_PLAYER: &[u8] = &[
    0x55, // push rbp
    0x48, 0x89, 0xe5, // mov rbp, rsp
    0xe8, 0xf7, 0xfe, 0xff, 0xff, // call 0x401000
    0x48, 0x8b, 0x05, 0x30, 0xef, 0x0f, 0x00, // mov rax, qword ptr [rip + 0xfef30]
    0xff, 0xd0, // call rax
    0x5d, // pop rbp
    0xc3, // ret
];

struct SimRegion {
    base: u64,
    data: Vec<u8>,
    protection: RegionProtection,
    path: Option<String>,
}

impl SimRegion {
    fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < self.data.len() as u64
    }
}

struct SimBreakpoint {
    trigger: BreakTrigger,
    size: usize,
    /// Taken out while the handler runs.
    handler: Option<TrapHandler>,
}

struct SimWatch {
    physical_address: u64,
    mode: WatchMode,
    max_entries: usize,
    log: Vec<WatchEntry>,
}

struct SimTarget {
    pid: u32,
    name: String,
    regions: Vec<SimRegion>,
    modules: Vec<ModuleInfo>,
    threads: Vec<ThreadInfo>,
    symbols: IndexMap<String, u64>,
    breakpoints: IndexMap<u64, SimBreakpoint>,
    watches: IndexMap<WatchId, SimWatch>,
    scans: IndexMap<ScanHandle, Vec<u64>>,
    next_handle: u64,
    reject_breakpoints: bool,
    refuse_watch_disable: bool,
}

impl SimTarget {
    fn region(&self, address: u64) -> Option<&SimRegion> {
        self.regions.iter().find(|r| r.contains(address))
    }

    fn read(&self, address: u64, size: usize) -> Result<Vec<u8>, ProviderError> {
        let region = self
            .region(address)
            .ok_or(ProviderError::Unmapped(address))?;
        let offset = (address - region.base) as usize;
        let end = offset
            .checked_add(size)
            .ok_or(ProviderError::ReadTooLarge(address, size))?;
        region
            .data
            .get(offset..end)
            .map(<[u8]>::to_vec)
            .ok_or(ProviderError::Unreadable(address))
    }

    /// Read as many bytes as available, up to `size`.
    fn read_partial(&self, address: u64, size: usize) -> Result<Vec<u8>, ProviderError> {
        let region = self
            .region(address)
            .ok_or(ProviderError::Unmapped(address))?;
        let offset = (address - region.base) as usize;
        let end = offset.saturating_add(size).min(region.data.len());
        Ok(region.data[offset..end].to_vec())
    }

    fn disassemble(&self, address: u64) -> Result<Instruction, ProviderError> {
        let code = self.read_partial(address, MAX_INSTRUCTION_LEN)?;
        disasm::disassemble_one(&code, address, true)
    }

    fn physical(&self, address: u64) -> Option<u64> {
        self.region(address).map(|_| address + PHYSICAL_OFFSET)
    }

    fn scan(&mut self, pattern: &BytePattern, filter: &ProtectionFilter) -> ScanHandle {
        let addresses = self
            .regions
            .iter()
            .filter(|r| filter.admits(&r.protection))
            .flat_map(|r| pattern.find_all(&r.data).map(|off| r.base + off as u64))
            .collect();
        self.next_handle += 1;
        let handle = ScanHandle(self.next_handle);
        self.scans.insert(handle, addresses);
        handle
    }
}

fn registers(ip: u64, sp: u64) -> RegisterSnapshot {
    let mut regs = RegisterSnapshot::new();
    for (i, name) in ["rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp"]
        .into_iter()
        .enumerate()
    {
        regs.insert(name.to_string(), 0x1000 * (i as u64 + 1));
    }
    regs.insert("rsp".to_string(), sp);
    regs.insert("rip".to_string(), ip);
    regs.insert("rflags".to_string(), 0x246);
    regs
}

/// Context of a simulated trap.
struct SimTrap {
    target: Arc<Mutex<SimTarget>>,
    ip: u64,
    resumed: bool,
}

impl SimTrap {
    fn target(&self) -> MutexGuard<'_, SimTarget> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TrapContext for SimTrap {
    fn instruction_pointer(&self) -> u64 {
        self.ip
    }

    fn stack_pointer(&self) -> u64 {
        STACK_POINTER
    }

    fn registers(&self) -> RegisterSnapshot {
        registers(self.ip, STACK_POINTER)
    }

    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>, ProviderError> {
        self.target().read(address, size)
    }

    fn disassemble(&self, address: u64) -> Result<Instruction, ProviderError> {
        self.target().disassemble(address)
    }

    fn resume(&mut self) {
        self.resumed = true;
    }
}

/// Simulated target, see module docs.
#[derive(Clone)]
pub struct SimulatedProvider {
    target: Arc<Mutex<SimTarget>>,
}

impl SimulatedProvider {
    /// Target without any memory.
    pub fn new(pid: u32, name: &str) -> Self {
        Self {
            target: Arc::new(Mutex::new(SimTarget {
                pid,
                name: name.to_string(),
                regions: vec![],
                modules: vec![],
                threads: vec![],
                symbols: IndexMap::new(),
                breakpoints: IndexMap::new(),
                watches: IndexMap::new(),
                scans: IndexMap::new(),
                next_handle: 0,
                reject_breakpoints: false,
                refuse_watch_disable: false,
            })),
        }
    }

    /// Small game-like target used by tests and by the `sim` host of the binary.
    ///
    /// | address    | content                                       |
    /// |------------|-----------------------------------------------|
    /// | `0x400000` | `game.exe` image, `MZ` header                 |
    /// | `0x401000` | `main`, a short function                      |
    /// | `0x401100` | `update_player`, calls `main`                 |
    /// | `0x500000` | zeroed heap page                              |
    /// | `0x500040` | `player_health`, dword `100`                  |
    /// | `0x500200` | `player_name`, `"PlayerOne"`                  |
    /// | `0x500300` | `guild_name`, UTF-16 `"Raiders"`              |
    /// | `0x500400` | `player_base`, pointer to `0x500500`          |
    /// | `0x500510` | pointer to `player_health`                    |
    /// | `0x600000` | `libsim.so`, read-only data                   |
    pub fn default_target() -> Self {
        let sim = Self::new(4242, "game.exe");

        let mut image = vec![0xcc; 0x2000];
        image[..2].copy_from_slice(b"MZ");
        let code_offset = (CODE_ADDRESS - IMAGE_BASE) as usize;
        image[code_offset..code_offset + CODE.len()].copy_from_slice(CODE);
        let update_offset = (UPDATE_PLAYER_ADDRESS - IMAGE_BASE) as usize;
        image[update_offset..update_offset + UPDATE_PLAYER.len()].copy_from_slice(UPDATE_PLAYER);
        sim.add_region(IMAGE_BASE, image, "R-X-", Some("/opt/game/game.exe"));
        sim.add_module("game.exe", IMAGE_BASE, 0x2000, Some("/opt/game/game.exe"));

        let mut heap = vec![0; 0x1000];
        heap[0x40..0x44].copy_from_slice(&100u32.to_le_bytes());
        heap[0x200..0x209].copy_from_slice(b"PlayerOne");
        let guild: Vec<u8> = "Raiders".encode_utf16().flat_map(u16::to_le_bytes).collect();
        heap[0x300..0x300 + guild.len()].copy_from_slice(&guild);
        heap[0x400..0x408].copy_from_slice(&(DATA_ADDRESS + 0x500).to_le_bytes());
        heap[0x510..0x518].copy_from_slice(&(DATA_ADDRESS + 0x40).to_le_bytes());
        sim.add_region(DATA_ADDRESS, heap, "RW--", None);

        let mut lib = vec![0; 0x1000];
        lib[0x10..0x1e].copy_from_slice(b"libsim v1.0.2\0");
        sim.add_region(0x600000, lib, "R---", Some("/usr/lib/libsim.so"));
        sim.add_module("libsim.so", 0x600000, 0x1000, Some("/usr/lib/libsim.so"));

        sim.add_region(STACK_BASE, vec![0; 0x1000], "RW--", Some("[stack]"));

        sim.add_thread(4242, Some("game.exe"));
        sim.add_thread(4243, Some("render"));

        for (name, address) in [
            ("main", CODE_ADDRESS),
            ("update_player", UPDATE_PLAYER_ADDRESS),
            ("player_health", DATA_ADDRESS + 0x40),
            ("player_name", DATA_ADDRESS + 0x200),
            ("guild_name", DATA_ADDRESS + 0x300),
            ("player_base", DATA_ADDRESS + 0x400),
        ] {
            sim.add_symbol(name, address);
        }
        sim
    }

    fn target(&self) -> MutexGuard<'_, SimTarget> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map a memory region, `protection` is in `RWXC` notation with `-` for unset flags.
    pub fn add_region(&self, base: u64, data: Vec<u8>, protection: &str, path: Option<&str>) {
        let flag = |i: usize| protection.as_bytes().get(i).is_some_and(|c| *c != b'-');
        let mut target = self.target();
        target.regions.push(SimRegion {
            base,
            data,
            protection: RegionProtection {
                read: flag(0),
                write: flag(1),
                execute: flag(2),
                copy_on_write: flag(3),
            },
            path: path.map(ToString::to_string),
        });
        target.regions.sort_by_key(|r| r.base);
    }

    pub fn add_module(&self, name: &str, base: u64, size: u64, path: Option<&str>) {
        self.target().modules.push(ModuleInfo {
            name: name.to_string(),
            base,
            size,
            path: path.map(ToString::to_string),
        });
    }

    pub fn add_thread(&self, id: u64, name: Option<&str>) {
        self.target().threads.push(ThreadInfo {
            id,
            name: name.map(ToString::to_string),
        });
    }

    pub fn add_symbol(&self, name: &str, address: u64) {
        self.target().symbols.insert(name.to_string(), address);
    }

    /// Overwrite target memory.
    pub fn write_bytes(&self, address: u64, bytes: &[u8]) -> Result<(), ProviderError> {
        let mut target = self.target();
        let region = target
            .regions
            .iter_mut()
            .find(|r| r.contains(address))
            .ok_or(ProviderError::Unmapped(address))?;
        let offset = (address - region.base) as usize;
        let dst = region
            .data
            .get_mut(offset..offset + bytes.len())
            .ok_or(ProviderError::Unreadable(address))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    /// Trigger the hardware breakpoint registered at `address` with the target stopped at
    /// `instruction_pointer`.
    ///
    /// Returns `None` if there is no such breakpoint, otherwise whether the handler resumed
    /// the target.
    pub fn fire(&self, address: u64, instruction_pointer: u64) -> Option<bool> {
        let mut handler = self
            .target()
            .breakpoints
            .get_mut(&address)?
            .handler
            .take()?;

        let mut ctx = SimTrap {
            target: self.target.clone(),
            ip: instruction_pointer,
            resumed: false,
        };
        handler(&mut ctx);

        // the breakpoint may be gone or replaced while the handler was running
        if let Some(bp) = self.target().breakpoints.get_mut(&address) {
            if bp.handler.is_none() {
                bp.handler = Some(handler);
            }
        }
        Some(ctx.resumed)
    }

    /// Simulate a memory access at virtual `address` done by the instruction at
    /// `instruction_pointer`. Returns the number of watches that recorded it.
    pub fn touch(&self, address: u64, instruction_pointer: u64) -> usize {
        let mut target = self.target();
        let Some(physical) = target.physical(address) else {
            return 0;
        };
        let instruction = target
            .disassemble(instruction_pointer)
            .ok()
            .map(|insn| insn.text);
        let registers = registers(instruction_pointer, STACK_POINTER);

        let mut recorded = 0;
        for watch in target.watches.values_mut() {
            if watch.physical_address / WATCH_GRANULE != physical / WATCH_GRANULE {
                continue;
            }
            if watch.log.len() < watch.max_entries {
                watch.log.push(WatchEntry {
                    physical_address: physical,
                    instruction_pointer,
                    registers: registers.clone(),
                    instruction: instruction.clone(),
                });
            }
            recorded += 1;
        }
        recorded
    }

    /// Make every following breakpoint installation fail.
    pub fn reject_breakpoints(&self, reject: bool) {
        self.target().reject_breakpoints = reject;
    }

    /// Make every following watch disable fail.
    pub fn refuse_watch_disable(&self, refuse: bool) {
        self.target().refuse_watch_disable = refuse;
    }

    pub fn live_breakpoints(&self) -> usize {
        self.target().breakpoints.len()
    }

    pub fn live_watches(&self) -> usize {
        self.target().watches.len()
    }

    pub fn live_scans(&self) -> usize {
        self.target().scans.len()
    }

    /// Mode a watch was started with.
    pub fn watch_mode(&self, id: WatchId) -> Option<WatchMode> {
        self.target().watches.get(&id).map(|w| w.mode)
    }

    /// Trigger and size of the breakpoint at `address`.
    pub fn breakpoint_at(&self, address: u64) -> Option<(BreakTrigger, usize)> {
        self.target()
            .breakpoints
            .get(&address)
            .map(|bp| (bp.trigger, bp.size))
    }
}

impl IntrospectionProvider for SimulatedProvider {
    fn process_info(&self) -> Result<ProcessInfo, ProviderError> {
        let target = self.target();
        Ok(ProcessInfo {
            pid: target.pid,
            name: target.name.clone(),
            is_64bit: true,
        })
    }

    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>, ProviderError> {
        self.target().read(address, size)
    }

    fn disassemble_one(&self, address: u64) -> Result<Instruction, ProviderError> {
        self.target().disassemble(address)
    }

    fn scan_pattern(
        &mut self,
        pattern: &BytePattern,
        filter: &ProtectionFilter,
    ) -> Result<ScanHandle, ProviderError> {
        Ok(self.target().scan(pattern, filter))
    }

    fn scan_value(&mut self, criteria: &ScanCriteria) -> Result<ScanHandle, ProviderError> {
        Ok(self
            .target()
            .scan(&criteria.to_pattern(), &criteria.protection))
    }

    fn enumerate_results(&self, handle: ScanHandle, max: usize) -> Result<ScanResults, ProviderError> {
        let target = self.target();
        let addresses = target
            .scans
            .get(&handle)
            .ok_or(ProviderError::UnknownScan(handle))?;
        Ok(ScanResults {
            total: addresses.len(),
            addresses: addresses.iter().take(max).copied().collect(),
        })
    }

    fn release_scan(&mut self, handle: ScanHandle) -> Result<(), ProviderError> {
        self.target()
            .scans
            .shift_remove(&handle)
            .map(|_| ())
            .ok_or(ProviderError::UnknownScan(handle))
    }

    fn resolve_symbol(&self, name: &str) -> Result<u64, ProviderError> {
        let target = self.target();
        if let Some(address) = target.symbols.get(name) {
            return Ok(*address);
        }
        target
            .modules
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
            .map(|m| m.base)
            .ok_or_else(|| ProviderError::SymbolNotFound(name.to_string()))
    }

    fn symbol_at(&self, address: u64) -> Result<Option<(String, u64)>, ProviderError> {
        let target = self.target();
        let Some(region) = target.region(address) else {
            return Ok(None);
        };
        Ok(target
            .symbols
            .iter()
            .filter(|(_, &symbol)| symbol >= region.base && symbol <= address)
            .max_by_key(|(_, &symbol)| symbol)
            .map(|(name, &symbol)| (name.clone(), symbol)))
    }

    fn enumerate_modules(&self) -> Result<Vec<ModuleInfo>, ProviderError> {
        Ok(self.target().modules.clone())
    }

    fn enumerate_threads(&self) -> Result<Vec<ThreadInfo>, ProviderError> {
        Ok(self.target().threads.clone())
    }

    fn enumerate_regions(&self) -> Result<Vec<MemoryRegion>, ProviderError> {
        Ok(self
            .target()
            .regions
            .iter()
            .map(|r| MemoryRegion {
                base: r.base,
                size: r.data.len() as u64,
                protection: r.protection,
                path: r.path.clone(),
            })
            .collect())
    }

    fn set_hardware_breakpoint(
        &mut self,
        address: u64,
        size: usize,
        trigger: BreakTrigger,
        on_hit: TrapHandler,
    ) -> Result<(), ProviderError> {
        let mut target = self.target();
        if target.reject_breakpoints {
            return Err(ProviderError::Unsupported("hardware breakpoint"));
        }
        if target.breakpoints.contains_key(&address) {
            return Err(ProviderError::BreakpointExists(address));
        }
        target.breakpoints.insert(
            address,
            SimBreakpoint {
                trigger,
                size,
                handler: Some(on_hit),
            },
        );
        Ok(())
    }

    fn remove_breakpoint(&mut self, address: u64) -> Result<(), ProviderError> {
        self.target()
            .breakpoints
            .shift_remove(&address)
            .map(|_| ())
            .ok_or(ProviderError::NoBreakpoint(address))
    }

    fn resolve_physical_address(&self, address: u64) -> Result<u64, ProviderError> {
        self.target()
            .physical(address)
            .ok_or(ProviderError::PhysicalResolution(address))
    }

    fn start_watch(
        &mut self,
        physical_address: u64,
        mode: WatchMode,
        options: WatchOptions,
    ) -> Result<WatchId, ProviderError> {
        let mut target = self.target();
        target.next_handle += 1;
        let id = WatchId(target.next_handle);
        target.watches.insert(
            id,
            SimWatch {
                physical_address,
                mode,
                max_entries: options.max_entries,
                log: vec![],
            },
        );
        Ok(id)
    }

    fn retrieve_watch_log(&mut self, id: WatchId) -> Result<Vec<WatchEntry>, ProviderError> {
        self.target()
            .watches
            .get(&id)
            .map(|w| w.log.clone())
            .ok_or(ProviderError::UnknownWatch(id))
    }

    fn disable_watch(&mut self, id: WatchId) -> Result<(), ProviderError> {
        let mut target = self.target();
        if target.refuse_watch_disable {
            return Err(ProviderError::Unsupported("watch disable"));
        }
        target
            .watches
            .shift_remove(&id)
            .map(|_| ())
            .ok_or(ProviderError::UnknownWatch(id))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::{ScalarValue, ValueType};

    #[test]
    fn test_default_target_layout() {
        let sim = SimulatedProvider::default_target();

        assert_eq!(
            sim.read_integer(DATA_ADDRESS + 0x40, ValueType::Dword).unwrap(),
            ScalarValue::Unsigned(100)
        );
        assert_eq!(sim.read_string(DATA_ADDRESS + 0x200, 64, false).unwrap(), "PlayerOne");
        assert_eq!(sim.read_string(DATA_ADDRESS + 0x300, 64, true).unwrap(), "Raiders");
        assert_eq!(sim.read_pointer(DATA_ADDRESS + 0x400).unwrap(), DATA_ADDRESS + 0x500);
        assert_eq!(sim.resolve_symbol("GAME.EXE").unwrap(), IMAGE_BASE);
        assert_eq!(
            sim.disassemble_one(CODE_ADDRESS).unwrap().text,
            "mov qword ptr [rsp + 8], rbx"
        );
        assert!(matches!(
            sim.read_bytes(0x10, 4),
            Err(ProviderError::Unmapped(0x10))
        ));
        assert!(matches!(
            sim.read_bytes(DATA_ADDRESS + 0xffe, 4),
            Err(ProviderError::Unreadable(_))
        ));
    }

    #[test]
    fn test_oversized_reads_fail() {
        let sim = SimulatedProvider::default_target();

        assert!(matches!(
            sim.read_bytes(DATA_ADDRESS + 0x200, usize::MAX),
            Err(ProviderError::ReadTooLarge(_, usize::MAX))
        ));
        assert!(matches!(
            sim.read_string(DATA_ADDRESS + 0x300, usize::MAX, true),
            Err(ProviderError::ReadTooLarge(_, usize::MAX))
        ));
        assert!(matches!(
            sim.read_string(DATA_ADDRESS + 0x200, usize::MAX / 2, false),
            Err(ProviderError::Unreadable(_))
        ));
        // decoding near the end of a region takes what is left
        assert!(sim.disassemble_one(IMAGE_BASE + 0x1fff).is_ok());
    }

    #[test]
    fn test_fire_without_resume() {
        let mut sim = SimulatedProvider::default_target();
        let ignore = || -> TrapHandler { Box::new(|_: &mut dyn TrapContext| {}) };
        sim.set_hardware_breakpoint(CODE_ADDRESS, 1, BreakTrigger::Execute, ignore())
            .unwrap();
        assert_eq!(sim.fire(CODE_ADDRESS, CODE_ADDRESS), Some(false));
        assert_eq!(sim.fire(CODE_ADDRESS + 1, CODE_ADDRESS), None);
        assert!(matches!(
            sim.set_hardware_breakpoint(CODE_ADDRESS, 1, BreakTrigger::Execute, ignore()),
            Err(ProviderError::BreakpointExists(_))
        ));
    }

    #[test]
    fn test_watch_log_is_capped() {
        let mut sim = SimulatedProvider::default_target();
        let physical = sim.resolve_physical_address(DATA_ADDRESS).unwrap();
        let id = sim
            .start_watch(physical, WatchMode::Write, WatchOptions { max_entries: 2 })
            .unwrap();

        for _ in 0..3 {
            assert_eq!(sim.touch(DATA_ADDRESS, CODE_ADDRESS), 1);
        }
        assert_eq!(sim.touch(DATA_ADDRESS + 8, CODE_ADDRESS), 0);

        let log = sim.retrieve_watch_log(id).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].physical_address, physical);
        assert_eq!(sim.watch_mode(id), Some(WatchMode::Write));
    }
}
