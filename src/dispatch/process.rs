use crate::address::format_address;
use crate::bridge::BridgeState;
use crate::dispatch::params::{resolve_address, Params};
use crate::dispatch::{CommandError, HandlerResult};
use crate::provider::{IntrospectionProvider, MemoryRegion, ModuleInfo, ProviderError};
use serde_json::{json, Value};

const DEFAULT_REGION_COUNT: usize = 100;

pub(super) fn arch_name(is_64bit: bool) -> &'static str {
    if is_64bit {
        "x64"
    } else {
        "x86"
    }
}

/// `name` or `name+displacement` of the closest symbol at or below `address`.
pub(super) fn symbol_label(
    provider: &dyn IntrospectionProvider,
    address: u64,
) -> Result<Option<String>, ProviderError> {
    let label = provider
        .symbol_at(address)?
        .map(|(name, base)| match address - base {
            0 => name,
            displacement => format!("{name}+{displacement:X}"),
        });
    Ok(label)
}

/// Region containing `address`.
pub(super) fn region_of(
    provider: &dyn IntrospectionProvider,
    address: u64,
) -> Result<Option<MemoryRegion>, ProviderError> {
    Ok(provider
        .enumerate_regions()?
        .into_iter()
        .find(|r| address >= r.base && address - r.base < r.size))
}

pub fn ping(state: &mut BridgeState, _: &Params) -> HandlerResult {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "message": "cebridge is alive",
        "timestamp": chrono::Utc::now().timestamp(),
        "uptime_seconds": state.uptime().as_secs_f64(),
        "session": state.session().to_string(),
    }))
}

pub fn get_process_info(state: &mut BridgeState, _: &Params) -> HandlerResult {
    let info = state.provider.process_info()?;
    let modules = state.provider.enumerate_modules()?;
    Ok(json!({
        "process_id": info.pid,
        "name": info.name,
        "is_64bit": info.is_64bit,
        "arch": arch_name(info.is_64bit),
        "module_count": modules.len(),
    }))
}

fn module_json(module: &ModuleInfo) -> Value {
    json!({
        "name": module.name,
        "address": format_address(module.base),
        "size": module.size,
        "path": module.path,
    })
}

pub fn enum_modules(state: &mut BridgeState, _: &Params) -> HandlerResult {
    let modules = state.provider.enumerate_modules()?;
    Ok(json!({
        "count": modules.len(),
        "modules": modules.iter().map(module_json).collect::<Vec<_>>(),
    }))
}

pub fn get_thread_list(state: &mut BridgeState, _: &Params) -> HandlerResult {
    let threads = state.provider.enumerate_threads()?;
    let threads: Vec<Value> = threads
        .iter()
        .map(|t| json!({"id": t.id, "id_hex": format!("{:X}", t.id), "name": t.name}))
        .collect();
    Ok(json!({
        "count": threads.len(),
        "threads": threads,
    }))
}

pub fn get_symbol_address(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let symbol = params.str("symbol")?;
    let address = resolve_address(symbol, state.provider.as_ref()).map_err(|reason| {
        CommandError::InvalidParam {
            name: "symbol",
            reason,
        }
    })?;
    Ok(json!({
        "symbol": symbol,
        "address": format_address(address),
        "value": address,
    }))
}

/// Reverse lookup of an address. `module`/`offset`, `symbol` and `region` are each present
/// only when asked for and known.
pub fn get_address_info(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let provider = state.provider.as_ref();
    let address = params.address("address", provider)?;
    let include_modules = params.bool_or("include_modules", true)?;
    let include_symbols = params.bool_or("include_symbols", true)?;
    let include_sections = params.bool_or("include_sections", false)?;

    let mut result = json!({ "address": format_address(address) });
    if include_modules {
        let modules = provider.enumerate_modules()?;
        if let Some(module) = modules.iter().find(|m| m.contains(address)) {
            result["module"] = json!(module.name);
            result["offset"] = json!(format_address(address - module.base));
        }
    }
    if include_symbols {
        if let Some(label) = symbol_label(provider, address)? {
            result["symbol"] = json!(label);
        }
    }
    if include_sections {
        if let Some(region) = region_of(provider, address)? {
            result["region"] = region_json(&region);
        }
    }
    Ok(result)
}

fn region_json(region: &MemoryRegion) -> Value {
    json!({
        "base": format_address(region.base),
        "size": region.size,
        "protection": region.protection.to_string(),
        "readable": region.protection.read,
        "writable": region.protection.write,
        "executable": region.protection.execute,
        "path": region.path,
    })
}

pub fn get_memory_regions(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let max = params.usize_or("max", DEFAULT_REGION_COUNT)?;
    let regions = state.provider.enumerate_regions()?;
    let regions: Vec<Value> = regions.iter().take(max).map(region_json).collect();
    Ok(json!({
        "count": regions.len(),
        "regions": regions,
    }))
}
