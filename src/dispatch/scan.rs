use crate::address::format_address;
use crate::bridge::BridgeState;
use crate::dispatch::params::Params;
use crate::dispatch::{CommandError, HandlerResult};
use crate::provider::{BytePattern, ProtectionFilter, ScanCriteria, ScanKind, ValueType};
use crate::resource::scan::one_shot;
use serde_json::{json, Value};
use std::str::FromStr;

const DEFAULT_RESULT_COUNT: usize = 100;
const DEFAULT_VALUE_PROTECTION: &str = "+W-C";
const DEFAULT_CODE_PROTECTION: &str = "+X";

fn protection(params: &Params, default: &str) -> Result<ProtectionFilter, CommandError> {
    let text = params.opt_str("protection")?.unwrap_or(default);
    ProtectionFilter::from_str(text).map_err(|e| CommandError::InvalidParam {
        name: "protection",
        reason: e.to_string(),
    })
}

fn pattern(text: &str) -> Result<BytePattern, CommandError> {
    BytePattern::from_str(text).map_err(|e| CommandError::InvalidParam {
        name: "pattern",
        reason: e.to_string(),
    })
}

/// Scan kind from the `type` and `value` parameters. `exact` is a dword.
fn scan_kind(params: &Params) -> Result<ScanKind, CommandError> {
    let value = params.text("value")?;
    let type_name = params
        .opt_str("type")?
        .unwrap_or("exact")
        .to_ascii_lowercase();

    let kind = match type_name.as_str() {
        "exact" => ScanKind::Value {
            value_type: ValueType::Dword,
            bytes: encode_value(ValueType::Dword, &value)?,
        },
        "string" => ScanKind::Text {
            text: value,
            wide: false,
        },
        "wstring" | "unicode" => ScanKind::Text {
            text: value,
            wide: true,
        },
        "aob" | "bytes" => ScanKind::Bytes(pattern(&value)?),
        other => {
            let value_type = ValueType::from_str(other).map_err(|_| CommandError::InvalidParam {
                name: "type",
                reason: format!("unknown scan type `{other}`"),
            })?;
            ScanKind::Value {
                value_type,
                bytes: encode_value(value_type, &value)?,
            }
        }
    };
    Ok(kind)
}

fn encode_value(value_type: ValueType, value: &str) -> Result<Vec<u8>, CommandError> {
    value_type
        .encode(value)
        .ok_or_else(|| CommandError::InvalidParam {
            name: "value",
            reason: format!("`{value}` is not a valid {value_type}"),
        })
}

pub fn scan_all(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let criteria = ScanCriteria {
        kind: scan_kind(params)?,
        protection: protection(params, DEFAULT_VALUE_PROTECTION)?,
    };
    let count = state.scan.start(state.provider.as_mut(), criteria)?;
    Ok(json!({ "count": count }))
}

pub fn get_scan_results(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let max = params.usize_or("max", DEFAULT_RESULT_COUNT)?;
    let page = state.scan.fetch(state.provider.as_ref(), max)?;
    let value_type = state.scan.criteria().and_then(ScanCriteria::value_type);

    let results: Vec<Value> = page
        .addresses
        .iter()
        .map(|&address| {
            let mut entry = json!({ "address": format_address(address) });
            if let Some(value) =
                value_type.and_then(|vt| state.provider.read_integer(address, vt).ok())
            {
                entry["value"] = value.to_json();
            }
            entry
        })
        .collect();

    Ok(json!({
        "total": page.total,
        "returned": results.len(),
        "results": results,
    }))
}

fn page_json(addresses: &[u64], total: usize) -> Value {
    json!({
        "count": addresses.len(),
        "total": total,
        "addresses": addresses.iter().map(|a| format_address(*a)).collect::<Vec<_>>(),
    })
}

pub fn aob_scan(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let pattern = pattern(params.str("pattern")?)?;
    let filter = protection(params, DEFAULT_CODE_PROTECTION)?;
    let limit = params.usize_or("limit", DEFAULT_RESULT_COUNT)?;

    let page = one_shot(state.provider.as_mut(), limit, |provider| {
        provider.scan_pattern(&pattern, &filter)
    })?;
    Ok(page_json(&page.addresses, page.total))
}

pub fn search_string(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let text = params.text("string")?;
    if text.is_empty() {
        return Err(CommandError::InvalidParam {
            name: "string",
            reason: "empty search string".to_string(),
        });
    }
    let wide = params.bool_or("wide", false)?;
    let limit = params.usize_or("limit", DEFAULT_RESULT_COUNT)?;
    let filter = protection(params, "")?;

    let criteria = ScanCriteria {
        kind: ScanKind::Text { text, wide },
        protection: filter,
    };
    let page = one_shot(state.provider.as_mut(), limit, |provider| {
        provider.scan_value(&criteria)
    })?;
    Ok(page_json(&page.addresses, page.total))
}
