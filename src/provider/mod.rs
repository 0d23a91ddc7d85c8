//! Capability interface of an introspection host.
//!
//! Everything the bridge does to an inspected target goes through [`IntrospectionProvider`].
//! A provider is owned by exactly one thread at a time (the owner thread of a running bridge),
//! so implementations only need to be [`Send`], never [`Sync`].

mod pattern;

pub use pattern::{BytePattern, PatternError, ProtectionFilter};

use indexmap::IndexMap;
use std::fmt::{self, Display, Formatter};
use strum_macros::{Display, EnumString, IntoStaticStr};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    // --------------------------------- memory errors ---------------------------------------------
    #[error("memory at {0:#X} is not readable")]
    Unreadable(u64),
    #[error("no memory region contains {0:#X}")]
    Unmapped(u64),
    #[error("read of {1} units at {0:#X} exceeds the address space")]
    ReadTooLarge(u64, usize),

    // --------------------------------- analysis errors -------------------------------------------
    #[error("disassembly failed at {0:#X}")]
    Disassembly(u64),
    #[error("install disassembler: {0}")]
    DisAsmInit(String),
    #[error("symbol `{0}` not found")]
    SymbolNotFound(String),

    // --------------------------------- resource errors -------------------------------------------
    #[error("physical address resolution failed for {0:#X}")]
    PhysicalResolution(u64),
    #[error("unknown scan handle {0}")]
    UnknownScan(ScanHandle),
    #[error("unknown watch {0}")]
    UnknownWatch(WatchId),
    #[error("no hardware breakpoint registered at {0:#X}")]
    NoBreakpoint(u64),
    #[error("hardware breakpoint already registered at {0:#X}")]
    BreakpointExists(u64),

    // --------------------------------- host errors -----------------------------------------------
    #[error("{0} is not supported by this host")]
    Unsupported(&'static str),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// Opaque provider-side handle of a scan result set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScanHandle(pub u64);

impl Display for ScanHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "scan#{}", self.0)
    }
}

/// Opaque provider-side handle of a memory-access watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

impl Display for WatchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Register name to value, in the order the host reports them.
pub type RegisterSnapshot = IndexMap<String, u64>;

/// Width and interpretation of a scalar in target memory.
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ValueType {
    Byte,
    Word,
    Dword,
    Qword,
    Float,
    Double,
}

/// Scalar read from target memory.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScalarValue {
    Unsigned(u64),
    Float(f64),
}

impl ScalarValue {
    pub fn to_json(self) -> serde_json::Value {
        match self {
            ScalarValue::Unsigned(v) => serde_json::Value::from(v),
            ScalarValue::Float(v) => serde_json::Value::from(v),
        }
    }
}

impl ValueType {
    pub fn size(self) -> usize {
        match self {
            ValueType::Byte => 1,
            ValueType::Word => 2,
            ValueType::Dword | ValueType::Float => 4,
            ValueType::Qword | ValueType::Double => 8,
        }
    }

    /// Interpret little-endian bytes, `None` if there are not enough of them.
    pub fn decode(self, bytes: &[u8]) -> Option<ScalarValue> {
        let bytes = bytes.get(..self.size())?;
        let value = match self {
            ValueType::Byte => ScalarValue::Unsigned(bytes[0] as u64),
            ValueType::Word => {
                ScalarValue::Unsigned(u16::from_le_bytes(bytes.try_into().ok()?) as u64)
            }
            ValueType::Dword => {
                ScalarValue::Unsigned(u32::from_le_bytes(bytes.try_into().ok()?) as u64)
            }
            ValueType::Qword => ScalarValue::Unsigned(u64::from_le_bytes(bytes.try_into().ok()?)),
            ValueType::Float => {
                ScalarValue::Float(f32::from_le_bytes(bytes.try_into().ok()?) as f64)
            }
            ValueType::Double => ScalarValue::Float(f64::from_le_bytes(bytes.try_into().ok()?)),
        };
        Some(value)
    }

    /// Little-endian representation of a textual value, `None` if it doesn't fit the type.
    pub fn encode(self, text: &str) -> Option<Vec<u8>> {
        let text = text.trim();
        let bytes = match self {
            ValueType::Float => text.parse::<f32>().ok()?.to_le_bytes().to_vec(),
            ValueType::Double => text.parse::<f64>().ok()?.to_le_bytes().to_vec(),
            _ => {
                let value = parse_integer(text)?;
                let bytes = value.to_le_bytes();
                let size = self.size();
                // negative values are stored in two's complement of the target width
                let fits = if value < 0 {
                    size == 8 || value >= -(1i64 << (size * 8 - 1))
                } else {
                    size == 8 || value < (1i64 << (size * 8))
                };
                if !fits {
                    return None;
                }
                bytes[..size].to_vec()
            }
        };
        Some(bytes)
    }
}

fn parse_integer(text: &str) -> Option<i64> {
    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as i64);
    }
    text.parse::<i64>()
        .ok()
        .or_else(|| text.parse::<u64>().ok().map(|v| v as i64))
}

/// What a value scan looks for.
#[derive(Clone, Debug, PartialEq)]
pub enum ScanKind {
    /// Exact scalar of the given type.
    Value { value_type: ValueType, bytes: Vec<u8> },
    /// Text, ASCII or UTF-16LE.
    Text { text: String, wide: bool },
    /// Byte array with optional wildcards.
    Bytes(BytePattern),
}

/// Value-scan criteria of a scan session.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanCriteria {
    pub kind: ScanKind,
    pub protection: ProtectionFilter,
}

impl ScanCriteria {
    /// Byte pattern equivalent to the criteria.
    pub fn to_pattern(&self) -> BytePattern {
        match &self.kind {
            ScanKind::Value { bytes, .. } => BytePattern::exact(bytes),
            ScanKind::Text { text, wide } => BytePattern::exact(&text_bytes(text, *wide)),
            ScanKind::Bytes(pattern) => pattern.clone(),
        }
    }

    /// Scalar type of the scanned value if any.
    pub fn value_type(&self) -> Option<ValueType> {
        match &self.kind {
            ScanKind::Value { value_type, .. } => Some(*value_type),
            _ => None,
        }
    }
}

/// Encode text the way it is laid out in target memory.
pub fn text_bytes(text: &str, wide: bool) -> Vec<u8> {
    if wide {
        text.encode_utf16().flat_map(u16::to_le_bytes).collect()
    } else {
        text.as_bytes().to_vec()
    }
}

/// Scan results page.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanResults {
    /// Total number of results of the scan.
    pub total: usize,
    /// At most `max` first result addresses.
    pub addresses: Vec<u64>,
}

/// Data access that triggers a hardware data breakpoint.
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, IntoStaticStr)]
pub enum AccessType {
    #[strum(to_string = "read", serialize = "r")]
    Read,
    #[strum(to_string = "write", serialize = "w")]
    Write,
    #[strum(to_string = "readwrite", serialize = "rw", serialize = "access")]
    ReadWrite,
}

/// Condition of a hardware breakpoint.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BreakTrigger {
    Execute,
    Access(AccessType),
}

/// Access kind recorded by a memory-access watch.
#[derive(Copy, Clone, PartialEq, Eq, Debug, EnumString, Display, IntoStaticStr)]
pub enum WatchMode {
    #[strum(to_string = "read", serialize = "r")]
    Read,
    #[strum(to_string = "write", serialize = "w")]
    Write,
    #[strum(to_string = "readwrite", serialize = "rw", serialize = "access")]
    ReadWrite,
    #[strum(to_string = "execute", serialize = "x")]
    Execute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchOptions {
    /// Maximum number of log entries the host keeps for the watch.
    pub max_entries: usize,
}

/// Single access recorded by a watch.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchEntry {
    pub physical_address: u64,
    pub instruction_pointer: u64,
    pub registers: RegisterSnapshot,
    /// Instruction at `instruction_pointer` if the host could resolve it.
    pub instruction: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub is_64bit: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModuleInfo {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub path: Option<String>,
}

impl ModuleInfo {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < self.size
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThreadInfo {
    pub id: u64,
    pub name: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionProtection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub copy_on_write: bool,
}

impl Display for RegionProtection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            flag(self.read, 'R'),
            flag(self.write, 'W'),
            flag(self.execute, 'X'),
            flag(self.copy_on_write, 'C'),
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub size: u64,
    pub protection: RegionProtection,
    pub path: Option<String>,
}

/// Single decoded instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub address: u64,
    pub bytes: Vec<u8>,
    /// Mnemonic and operands, Intel syntax.
    pub text: String,
}

impl Instruction {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// View of a stopped target given to a trap handler.
///
/// The target stays suspended until [`TrapContext::resume`] is called, a handler that
/// doesn't resume hangs the target.
pub trait TrapContext {
    fn instruction_pointer(&self) -> u64;

    fn stack_pointer(&self) -> u64;

    fn registers(&self) -> RegisterSnapshot;

    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>, ProviderError>;

    fn disassemble(&self, address: u64) -> Result<Instruction, ProviderError>;

    fn pointer_size(&self) -> usize {
        8
    }

    /// Read up to `depth` pointer-sized words starting at the stack pointer.
    fn read_stack(&self, depth: usize) -> Vec<u64> {
        let width = self.pointer_size();
        let sp = self.stack_pointer();
        (0..depth)
            .map_while(|i| {
                let bytes = self.read_bytes(sp + (i * width) as u64, width).ok()?;
                Some(le_word(&bytes))
            })
            .collect()
    }

    /// Let the target continue after the trap.
    fn resume(&mut self);
}

/// Called by the host on every hit of a hardware breakpoint, from any host thread.
pub type TrapHandler = Box<dyn FnMut(&mut dyn TrapContext) + Send>;

/// Interpret up to 8 little-endian bytes as an unsigned word.
pub fn le_word(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (*b as u64) << (i * 8))
}

/// Target-control primitives of an introspection host.
pub trait IntrospectionProvider: Send {
    fn process_info(&self) -> Result<ProcessInfo, ProviderError>;

    fn pointer_size(&self) -> usize {
        8
    }

    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>, ProviderError>;

    fn read_integer(&self, address: u64, value_type: ValueType) -> Result<ScalarValue, ProviderError> {
        let bytes = self.read_bytes(address, value_type.size())?;
        value_type
            .decode(&bytes)
            .ok_or(ProviderError::Unreadable(address))
    }

    /// Read a NUL-terminated string of at most `max_length` characters.
    fn read_string(&self, address: u64, max_length: usize, wide: bool) -> Result<String, ProviderError> {
        let char_size = if wide { 2 } else { 1 };
        let size = max_length
            .checked_mul(char_size)
            .ok_or(ProviderError::ReadTooLarge(address, max_length))?;
        let bytes = self.read_bytes(address, size)?;
        let text = if wide {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .take_while(|&u| u != 0)
                .collect();
            String::from_utf16_lossy(&units)
        } else {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        };
        Ok(text)
    }

    fn read_pointer(&self, address: u64) -> Result<u64, ProviderError> {
        let bytes = self.read_bytes(address, self.pointer_size())?;
        Ok(le_word(&bytes))
    }

    fn disassemble_one(&self, address: u64) -> Result<Instruction, ProviderError>;

    fn scan_pattern(
        &mut self,
        pattern: &BytePattern,
        filter: &ProtectionFilter,
    ) -> Result<ScanHandle, ProviderError>;

    fn scan_value(&mut self, criteria: &ScanCriteria) -> Result<ScanHandle, ProviderError>;

    fn enumerate_results(&self, handle: ScanHandle, max: usize) -> Result<ScanResults, ProviderError>;

    /// Destroy a result set created by `scan_pattern` or `scan_value`.
    fn release_scan(&mut self, handle: ScanHandle) -> Result<(), ProviderError>;

    fn resolve_symbol(&self, name: &str) -> Result<u64, ProviderError>;

    /// Closest symbol at or below `address` within the same mapping, with its address.
    fn symbol_at(&self, _address: u64) -> Result<Option<(String, u64)>, ProviderError> {
        Ok(None)
    }

    fn enumerate_modules(&self) -> Result<Vec<ModuleInfo>, ProviderError>;

    fn enumerate_threads(&self) -> Result<Vec<ThreadInfo>, ProviderError>;

    fn enumerate_regions(&self) -> Result<Vec<MemoryRegion>, ProviderError>;

    fn set_hardware_breakpoint(
        &mut self,
        address: u64,
        size: usize,
        trigger: BreakTrigger,
        on_hit: TrapHandler,
    ) -> Result<(), ProviderError>;

    fn remove_breakpoint(&mut self, address: u64) -> Result<(), ProviderError>;

    fn resolve_physical_address(&self, address: u64) -> Result<u64, ProviderError>;

    fn start_watch(
        &mut self,
        physical_address: u64,
        mode: WatchMode,
        options: WatchOptions,
    ) -> Result<WatchId, ProviderError>;

    /// Cumulative log of a watch, reading it doesn't consume entries.
    fn retrieve_watch_log(&mut self, id: WatchId) -> Result<Vec<WatchEntry>, ProviderError>;

    fn disable_watch(&mut self, id: WatchId) -> Result<(), ProviderError>;
}
