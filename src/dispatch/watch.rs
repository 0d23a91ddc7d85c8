use crate::address::format_address;
use crate::bridge::BridgeState;
use crate::dispatch::params::Params;
use crate::dispatch::HandlerResult;
use crate::provider::{WatchEntry, WatchMode};
use serde_json::{json, Value};

const DEFAULT_MAX_ENTRIES: usize = 1000;

fn entry_json(entry: &WatchEntry) -> Value {
    let mut value = json!({
        "physical_address": format_address(entry.physical_address),
        "instruction_pointer": format_address(entry.instruction_pointer),
        "registers": entry.registers,
    });
    if let Some(instruction) = &entry.instruction {
        value["instruction"] = json!(instruction);
    }
    value
}

pub fn get_physical_address(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let address = params.address("address", state.provider.as_ref())?;
    let physical = state.provider.resolve_physical_address(address)?;
    Ok(json!({
        "virtual_address": format_address(address),
        "physical_address": format_address(physical),
    }))
}

pub fn start_dbvm_watch(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let address = params.address("address", state.provider.as_ref())?;
    let mode = params.parse_or("mode", WatchMode::Write)?;
    let max_entries = params.usize_or("max_entries", DEFAULT_MAX_ENTRIES)?;

    let started = state
        .watches
        .start(state.provider.as_mut(), address, mode, max_entries)?;
    Ok(json!({
        "status": "monitoring",
        "watch_id": started.watch_id.0,
        "address": format_address(address),
        "physical_address": format_address(started.physical_address),
        "mode": started.mode.to_string(),
    }))
}

pub fn poll_dbvm_watch(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let address = params.address("address", state.provider.as_ref())?;
    let max_results = params.usize_or("max_results", DEFAULT_MAX_ENTRIES)?;
    let clear = params.bool_or("clear", true)?;

    let poll = state
        .watches
        .poll(state.provider.as_mut(), address, max_results, clear)?;
    Ok(json!({
        "status": "monitoring",
        "address": format_address(address),
        "hit_count": poll.hits.len(),
        "hits": poll.hits.iter().map(entry_json).collect::<Vec<_>>(),
        "total": poll.total,
        "uptime_seconds": poll.uptime.as_secs_f64(),
        "started_at": poll.started_at.to_rfc3339(),
    }))
}

pub fn stop_dbvm_watch(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let address = params.address("address", state.provider.as_ref())?;
    let stopped = state.watches.stop(state.provider.as_mut(), address)?;
    Ok(json!({
        "status": "stopped",
        "address": format_address(address),
        "hit_count": stopped.hits.len(),
        "hits": stopped.hits.iter().map(entry_json).collect::<Vec<_>>(),
        "duration_seconds": stopped.duration.as_secs_f64(),
    }))
}
