use crate::address::format_address;
use crate::bridge::BridgeState;
use crate::dispatch::params::Params;
use crate::dispatch::{CommandError, HandlerResult};
use crate::provider::AccessType;
use crate::resource::CaptureOptions;
use serde_json::json;

/// Deepest stack capture an execute breakpoint may ask for, in pointer-sized slots.
const MAX_STACK_DEPTH: usize = 1024;

pub fn set_breakpoint(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let address = params.address("address", state.provider.as_ref())?;
    let id = params.opt_str("id")?.map(str::to_string);
    let defaults = CaptureOptions::default();
    let capture = CaptureOptions {
        registers: params.bool_or("capture_registers", defaults.registers)?,
        stack: params.bool_or("capture_stack", defaults.stack)?,
        stack_depth: params.usize_or("stack_depth", defaults.stack_depth)?,
    };
    if capture.stack_depth > MAX_STACK_DEPTH {
        return Err(CommandError::InvalidParam {
            name: "stack_depth",
            reason: format!("at most {MAX_STACK_DEPTH} stack slots"),
        });
    }

    let record = state
        .breakpoints
        .set_execute(state.provider.as_mut(), address, id, capture)?;
    Ok(json!({
        "id": record.id,
        "slot": record.slot,
        "address": format_address(record.address),
    }))
}

pub fn set_data_breakpoint(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let address = params.address("address", state.provider.as_ref())?;
    let id = params.opt_str("id")?.map(str::to_string);
    let access_type = params.parse_or("access_type", AccessType::Write)?;
    let size = params.usize_or("size", 4)?;

    let record =
        state
            .breakpoints
            .set_data(state.provider.as_mut(), address, access_type, size, id)?;
    Ok(json!({
        "id": record.id,
        "slot": record.slot,
        "address": format_address(record.address),
        "access_type": access_type.to_string(),
        "size": record.size,
    }))
}

pub fn remove_breakpoint(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let id = params.str("id")?;
    let record = state.breakpoints.remove(state.provider.as_mut(), id)?;
    Ok(json!({ "id": record.id }))
}

pub fn list_breakpoints(state: &mut BridgeState, _: &Params) -> HandlerResult {
    let breakpoints = state.breakpoints.list();
    Ok(json!({
        "count": breakpoints.len(),
        "breakpoints": breakpoints,
    }))
}

pub fn clear_all_breakpoints(state: &mut BridgeState, _: &Params) -> HandlerResult {
    let removed = state.breakpoints.clear_all(state.provider.as_mut());
    Ok(json!({ "removed": removed }))
}

pub fn get_breakpoint_hits(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let id = params.opt_str("id")?;
    let clear = params.bool_or("clear", true)?;
    let hits = state.breakpoints.hits(id, clear)?;
    let hits = serde_json::to_value(&hits).map_err(|e| CommandError::Internal(e.to_string()))?;
    Ok(json!({
        "count": hits.as_array().map_or(0, Vec::len),
        "hits": hits,
    }))
}

#[cfg(test)]
mod test {
    use crate::dispatch::test::{call, sim_state};
    use serde_json::json;

    #[test]
    fn test_execute_breakpoint_hits() {
        let (mut state, sim) = sim_state();

        let set = call(&mut state, "set_breakpoint", json!({"address": "main", "capture_stack": true}));
        assert_eq!(set["success"], json!(true));
        assert_eq!(set["id"], json!("bp_0x401000"));
        assert_eq!(set["slot"], json!(1));

        assert_eq!(sim.fire(0x401000, 0x401000), Some(true));
        assert_eq!(sim.fire(0x401000, 0x401000), Some(true));

        let hits = call(&mut state, "get_breakpoint_hits", json!({"id": "bp_0x401000", "clear": false}));
        assert_eq!(hits["count"], json!(2));
        assert_eq!(hits["hits"][0]["address"], json!("0x401000"));
        assert!(hits["hits"][0]["registers"].is_object());
        assert!(hits["hits"][0]["stack"].is_array());

        // default clears the history
        let hits = call(&mut state, "get_breakpoint_hits", json!({}));
        assert_eq!(hits["count"], json!(2));
        let hits = call(&mut state, "get_breakpoint_hits", json!({}));
        assert_eq!(hits["count"], json!(0));
    }

    #[test]
    fn test_stack_depth_is_bounded() {
        let (mut state, sim) = sim_state();

        let set = call(
            &mut state,
            "set_breakpoint",
            json!({"address": "main", "capture_stack": true, "stack_depth": 1u64 << 40}),
        );
        assert_eq!(set["success"], json!(false));
        assert_eq!(sim.live_breakpoints(), 0);
    }

    #[test]
    fn test_slot_exhaustion_and_clear() {
        let (mut state, sim) = sim_state();

        for i in 0..4 {
            let set = call(
                &mut state,
                "set_breakpoint",
                json!({"address": format!("0x{:X}", 0x401000 + i * 5), "id": format!("bp{i}")}),
            );
            assert_eq!(set["slot"], json!(i + 1));
        }
        let full = call(&mut state, "set_data_breakpoint", json!({"address": "player_health"}));
        assert_eq!(full["success"], json!(false));
        assert_eq!(full["error"], json!("no free hardware slot"));

        let list = call(&mut state, "list_breakpoints", json!({}));
        assert_eq!(list["count"], json!(4));
        assert_eq!(list["breakpoints"][0]["id"], json!("bp0"));
        assert_eq!(list["breakpoints"][0]["kind"], json!("execute"));

        let removed = call(&mut state, "remove_breakpoint", json!({"id": "bp2"}));
        assert_eq!(removed["id"], json!("bp2"));
        let missing = call(&mut state, "remove_breakpoint", json!({"id": "bp2"}));
        assert_eq!(missing["success"], json!(false));

        let data = call(
            &mut state,
            "set_data_breakpoint",
            json!({"address": "player_health", "access_type": "rw", "size": 4}),
        );
        assert_eq!(data["slot"], json!(3));
        assert_eq!(data["access_type"], json!("readwrite"));

        let cleared = call(&mut state, "clear_all_breakpoints", json!({}));
        assert_eq!(cleared["removed"], json!(4));
        assert_eq!(sim.live_breakpoints(), 0);
    }

    #[test]
    fn test_data_breakpoint_capture() {
        let (mut state, sim) = sim_state();

        call(&mut state, "set_data_breakpoint", json!({"address": "0x500040", "id": "health"}));
        assert_eq!(sim.fire(0x500040, 0x401011), Some(true));

        let hits = call(&mut state, "get_breakpoint_hits", json!({"id": "health"}));
        assert_eq!(hits["count"], json!(1));
        assert_eq!(hits["hits"][0]["value"], json!(100));
        assert_eq!(hits["hits"][0]["instruction_pointer"], json!("0x401011"));
        assert!(hits["hits"][0]["instruction"].is_string());

        let bad = call(&mut state, "set_data_breakpoint", json!({"address": "0x500040", "size": 3}));
        assert_eq!(bad["success"], json!(false));
    }
}
