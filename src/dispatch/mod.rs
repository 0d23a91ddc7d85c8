//! Command dispatch: method name to handler, handler outcome to response.

mod analysis;
mod breakpoint;
mod disasm;
mod memory;
pub mod params;
mod process;
mod scan;
mod watch;

use crate::bridge::BridgeState;
use crate::cb_error;
use crate::protocol::{Request, Response, INTERNAL_ERROR, METHOD_NOT_FOUND};
use crate::provider::ProviderError;
use crate::resource::{BreakpointError, ScanError, WatchError};
use params::Params;
use serde_json::{json, Value};
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    // --------------------------------- request errors --------------------------------------------
    #[error("missing parameter `{0}`")]
    MissingParam(&'static str),
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParam { name: &'static str, reason: String },

    // --------------------------------- domain errors ---------------------------------------------
    #[error(transparent)]
    Breakpoint(#[from] BreakpointError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("{0}")]
    Analysis(String),

    // --------------------------------- internal errors -------------------------------------------
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommandError {
    /// Internal errors are reported as protocol errors, every other one is a domain failure
    /// the caller is expected to branch on.
    pub fn is_internal(&self) -> bool {
        matches!(self, CommandError::Internal(_))
    }
}

pub type HandlerResult = Result<Value, CommandError>;
type Handler = fn(&mut BridgeState, &Params) -> HandlerResult;

/// Every method the bridge answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, IntoStaticStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Command {
    Ping,
    GetProcessInfo,
    EnumModules,
    GetThreadList,
    GetSymbolAddress,
    GetAddressInfo,
    #[strum(to_string = "get_memory_regions", serialize = "enum_memory_regions_full")]
    GetMemoryRegions,

    ReadMemory,
    ReadInteger,
    ReadString,
    #[strum(to_string = "read_pointer_chain", serialize = "read_pointer")]
    ReadPointerChain,
    ChecksumMemory,

    ScanAll,
    GetScanResults,
    AobScan,
    SearchString,

    Disassemble,
    GetInstructionInfo,
    FindFunctionBoundaries,
    AnalyzeFunction,
    FindReferences,
    FindCallReferences,
    GenerateSignature,
    DissectStructure,

    SetBreakpoint,
    SetDataBreakpoint,
    RemoveBreakpoint,
    ListBreakpoints,
    ClearAllBreakpoints,
    GetBreakpointHits,

    GetPhysicalAddress,
    StartDbvmWatch,
    PollDbvmWatch,
    StopDbvmWatch,
}

impl Command {
    fn handler(self) -> Handler {
        match self {
            Command::Ping => process::ping,
            Command::GetProcessInfo => process::get_process_info,
            Command::EnumModules => process::enum_modules,
            Command::GetThreadList => process::get_thread_list,
            Command::GetSymbolAddress => process::get_symbol_address,
            Command::GetAddressInfo => process::get_address_info,
            Command::GetMemoryRegions => process::get_memory_regions,
            Command::ReadMemory => memory::read_memory,
            Command::ReadInteger => memory::read_integer,
            Command::ReadString => memory::read_string,
            Command::ReadPointerChain => memory::read_pointer_chain,
            Command::ChecksumMemory => memory::checksum_memory,
            Command::ScanAll => scan::scan_all,
            Command::GetScanResults => scan::get_scan_results,
            Command::AobScan => scan::aob_scan,
            Command::SearchString => scan::search_string,
            Command::Disassemble => disasm::disassemble,
            Command::GetInstructionInfo => disasm::get_instruction_info,
            Command::FindFunctionBoundaries => analysis::find_function_boundaries,
            Command::AnalyzeFunction => analysis::analyze_function,
            Command::FindReferences => analysis::find_references,
            Command::FindCallReferences => analysis::find_call_references,
            Command::GenerateSignature => analysis::generate_signature,
            Command::DissectStructure => analysis::dissect_structure,
            Command::SetBreakpoint => breakpoint::set_breakpoint,
            Command::SetDataBreakpoint => breakpoint::set_data_breakpoint,
            Command::RemoveBreakpoint => breakpoint::remove_breakpoint,
            Command::ListBreakpoints => breakpoint::list_breakpoints,
            Command::ClearAllBreakpoints => breakpoint::clear_all_breakpoints,
            Command::GetBreakpointHits => breakpoint::get_breakpoint_hits,
            Command::GetPhysicalAddress => watch::get_physical_address,
            Command::StartDbvmWatch => watch::start_dbvm_watch,
            Command::PollDbvmWatch => watch::poll_dbvm_watch,
            Command::StopDbvmWatch => watch::stop_dbvm_watch,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Execute a request against the bridge state. Always produces exactly one response.
pub fn dispatch(state: &mut BridgeState, request: &Request) -> Response {
    let Ok(command) = Command::from_str(&request.method) else {
        return Response::error(
            request.id.clone(),
            METHOD_NOT_FOUND,
            format!("method not found: {}", request.method),
        )
        .in_reply_to(request);
    };

    let params = Params::new(&request.params);
    let handler = command.handler();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(state, &params)));

    let response = match outcome {
        Ok(Ok(mut result)) => {
            if let Value::Object(map) = &mut result {
                map.insert("success".to_string(), Value::Bool(true));
            }
            Response::result(request.id.clone(), result)
        }
        Ok(Err(e)) if e.is_internal() => {
            cb_error!(target: "dispatch", "{command} failed: {e:#}");
            Response::error(request.id.clone(), INTERNAL_ERROR, e.to_string())
        }
        Ok(Err(e)) => Response::result(
            request.id.clone(),
            json!({"success": false, "error": e.to_string()}),
        ),
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            cb_error!(target: "dispatch", "{command} panicked: {msg}");
            Response::error(
                request.id.clone(),
                INTERNAL_ERROR,
                format!("internal error: {command} panicked: {msg}"),
            )
        }
    };
    response.in_reply_to(request)
}
