use crate::address::format_address;
use crate::bridge::BridgeState;
use crate::dispatch::params::Params;
use crate::dispatch::{CommandError, HandlerResult};
use crate::provider::ValueType;
use itertools::Itertools;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

const DEFAULT_READ_SIZE: usize = 256;
const DEFAULT_STRING_LENGTH: usize = 256;
/// Reads above this size are rejected before touching the target.
const MAX_READ_SIZE: usize = 16 * 1024 * 1024;
/// Upper bound of `max_length` for string reads, in characters.
const MAX_STRING_LENGTH: usize = 64 * 1024;

fn read_size(params: &Params, default: usize) -> Result<usize, CommandError> {
    let size = params.usize_or("size", default)?;
    if size == 0 || size > MAX_READ_SIZE {
        return Err(CommandError::InvalidParam {
            name: "size",
            reason: format!("size must be in 1..={MAX_READ_SIZE}"),
        });
    }
    Ok(size)
}

/// Bytes as upper-case hex pairs separated by spaces.
pub(super) fn hex_dump(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).join(" ")
}

pub fn read_memory(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let address = params.address("address", state.provider.as_ref())?;
    let size = read_size(params, DEFAULT_READ_SIZE)?;
    let bytes = state.provider.read_bytes(address, size)?;
    Ok(json!({
        "address": format_address(address),
        "size": bytes.len(),
        "data": hex_dump(&bytes),
        "bytes": bytes,
    }))
}

pub fn read_integer(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let address = params.address("address", state.provider.as_ref())?;
    let value_type = params.parse_or("type", ValueType::Dword)?;
    let value = state.provider.read_integer(address, value_type)?;
    Ok(json!({
        "address": format_address(address),
        "type": value_type.to_string(),
        "value": value.to_json(),
    }))
}

pub fn read_string(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let address = params.address("address", state.provider.as_ref())?;
    let max_length = params.usize_or("max_length", DEFAULT_STRING_LENGTH)?;
    if max_length > MAX_STRING_LENGTH {
        return Err(CommandError::InvalidParam {
            name: "max_length",
            reason: format!("max_length must be at most {MAX_STRING_LENGTH}"),
        });
    }
    let wide = params.bool_or("wide", false)?;
    let value = state.provider.read_string(address, max_length, wide)?;
    Ok(json!({
        "address": format_address(address),
        "value": value,
        "length": value.chars().count(),
        "wide": wide,
    }))
}

/// Follow a pointer path: at every step the pointer at the current address is read and
/// the offset is added to it.
pub fn read_pointer_chain(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let provider = state.provider.as_ref();
    let base = match params.opt_address("base", provider)? {
        Some(base) => base,
        None => params
            .opt_address("address", provider)?
            .ok_or(CommandError::MissingParam("base"))?,
    };
    let offsets = params.offsets_or("offsets", &[0])?;

    let mut current = base;
    let mut chain = Vec::with_capacity(offsets.len());
    for offset in offsets {
        let pointer = provider.read_pointer(current)?;
        let next = pointer.wrapping_add_signed(offset);
        chain.push(json!({
            "address": format_address(current),
            "value": format_address(pointer),
            "offset": offset,
            "next": format_address(next),
        }));
        current = next;
    }

    let final_value = match params.opt_str("type")? {
        Some(_) => {
            let value_type = params.parse_or("type", ValueType::Dword)?;
            provider.read_integer(current, value_type).ok().map(|v| v.to_json())
        }
        None => provider.read_pointer(current).ok().map(Value::from),
    };

    let mut result = json!({
        "base": format_address(base),
        "chain": chain,
        "final_address": format_address(current),
    });
    if let Some(value) = final_value {
        result["final_value"] = value;
    }
    Ok(result)
}

pub fn checksum_memory(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let address = params.address("address", state.provider.as_ref())?;
    let size = read_size(params, DEFAULT_READ_SIZE)?;
    let bytes = state.provider.read_bytes(address, size)?;
    let digest = Sha256::digest(&bytes);
    Ok(json!({
        "address": format_address(address),
        "size": bytes.len(),
        "sha256": hex::encode(digest),
    }))
}
