//! Heuristics over target code and data: function bounds, cross references, byte signatures
//! and structure layout guesses.
//!
//! Everything here reads target memory through the provider and decodes it locally, the
//! target is never modified.

use crate::address::{format_address, parse_address_literal};
use crate::bridge::BridgeState;
use crate::dispatch::params::Params;
use crate::dispatch::process::{arch_name, region_of, symbol_label};
use crate::dispatch::{CommandError, HandlerResult};
use crate::host::disasm::{Decoder, MAX_INSTRUCTION_LEN};
use crate::muted_error;
use crate::provider::{
    le_word, BytePattern, Instruction, IntrospectionProvider, ProtectionFilter, ProviderError,
};
use crate::resource::scan::one_shot;
use serde_json::{json, Value};
use std::ops::Range;
use strum_macros::IntoStaticStr;

const DEFAULT_FUNCTION_SEARCH: usize = 4096;
const MAX_FUNCTION_SEARCH: usize = 1024 * 1024;
const DEFAULT_REFERENCE_LIMIT: usize = 50;
const DEFAULT_CALL_REFERENCE_LIMIT: usize = 100;
const MAX_REFERENCE_LIMIT: usize = 10_000;
/// Executable regions are searched for references in windows of this size.
const REFERENCE_CHUNK: usize = 1024 * 1024;
/// A signature is checked for uniqueness once it is at least this long.
const MIN_SIGNATURE_LEN: usize = 5;
const MAX_SIGNATURE_LEN: usize = 64;
const MAX_SIGNATURE_INSTRUCTIONS: usize = 16;
const DEFAULT_STRUCTURE_SIZE: usize = 256;
const MAX_STRUCTURE_SIZE: usize = 4096;
const MIN_STRING_LEN: usize = 4;

/// `int3`, compilers fill the gaps between functions with it.
const PADDING: u8 = 0xcc;

/// `push rbp; mov rbp, rsp` in both encodings, then the 32-bit forms.
const PROLOGUES: &[&[u8]] = &[
    &[0x55, 0x48, 0x89, 0xe5],
    &[0x55, 0x48, 0x8b, 0xec],
    &[0x55, 0x89, 0xe5],
    &[0x55, 0x8b, 0xec],
];

fn bounded(params: &Params, name: &'static str, default: usize, max: usize) -> Result<usize, CommandError> {
    let value = params.usize_or(name, default)?;
    if value == 0 || value > max {
        return Err(CommandError::InvalidParam {
            name,
            reason: format!("{name} must be in 1..={max}"),
        });
    }
    Ok(value)
}

fn mnemonic(insn: &Instruction) -> &str {
    insn.text.split_whitespace().next().unwrap_or_default()
}

/// Offset of the 32-bit displacement of a `rip`-relative operand inside the encoding.
fn rip_displacement(insn: &Instruction) -> Option<usize> {
    let (_, operand) = insn.text.split_once("[rip ")?;
    let (negative, rest) = match operand.strip_prefix("- ") {
        Some(rest) => (true, rest),
        None => (false, operand.strip_prefix("+ ")?),
    };
    let magnitude = parse_address_literal(rest.split(']').next()?)?;
    let displacement = i32::try_from(magnitude).ok()?;
    let displacement = if negative {
        displacement.wrapping_neg()
    } else {
        displacement
    };
    let needle = displacement.to_le_bytes();
    insn.bytes.windows(4).position(|w| w == needle)
}

// --------------------------------- function bounds -----------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
enum StartMethod {
    /// Frame-pointer prologue.
    Prologue,
    /// First byte after a run of `int3` padding.
    Padding,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FunctionBounds {
    start: u64,
    /// First byte after the function.
    end: u64,
    method: StartMethod,
}

impl FunctionBounds {
    fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// Closest function start at or below `address`, `code` begins at `base`.
fn find_start(code: &[u8], base: u64, address: u64) -> Option<(u64, StartMethod)> {
    let last = usize::try_from(address - base).ok()?.min(code.len().checked_sub(1)?);
    (0..=last).rev().find_map(|i| {
        if PROLOGUES.iter().any(|prologue| code[i..].starts_with(prologue)) {
            return Some((base + i as u64, StartMethod::Prologue));
        }
        (i > 0 && code[i - 1] == PADDING && code[i] != PADDING)
            .then(|| (base + i as u64, StartMethod::Padding))
    })
}

/// Sweep from `start` to the first `ret` past `address`. Padding or an undecodable
/// instruction before that means `address` is not inside the function.
fn find_end(decoder: &Decoder, code: &[u8], base: u64, start: u64, address: u64) -> Option<u64> {
    let mut offset = usize::try_from(start - base).ok()?;
    while offset < code.len() {
        let current = base + offset as u64;
        let insn = muted_error!(decoder.decode(&code[offset..], current), "function sweep:")?;
        if insn.bytes.first() == Some(&PADDING) {
            return (current > address).then_some(current);
        }
        offset += insn.size().max(1);
        let next = base + offset as u64;
        if mnemonic(&insn) == "ret" && next > address {
            return Some(next);
        }
    }
    None
}

fn function_bounds(
    provider: &dyn IntrospectionProvider,
    decoder: &Decoder,
    address: u64,
    max_search: usize,
) -> Result<Option<FunctionBounds>, ProviderError> {
    let region = region_of(provider, address)?.ok_or(ProviderError::Unmapped(address))?;
    let region_end = region.base.saturating_add(region.size);
    let low = address.saturating_sub(max_search as u64).max(region.base);
    let high = address.saturating_add(max_search as u64).min(region_end);
    let code = provider.read_bytes(low, (high - low) as usize)?;

    let Some((start, method)) = find_start(&code, low, address) else {
        return Ok(None);
    };
    Ok(find_end(decoder, &code, low, start, address).map(|end| FunctionBounds { start, end, method }))
}

fn open_decoder(provider: &dyn IntrospectionProvider) -> Result<(Decoder, bool), ProviderError> {
    let is_64bit = provider.process_info()?.is_64bit;
    Ok((Decoder::new(is_64bit)?, is_64bit))
}

pub fn find_function_boundaries(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let provider = state.provider.as_ref();
    let address = params.address("address", provider)?;
    let max_search = bounded(params, "max_search", DEFAULT_FUNCTION_SEARCH, MAX_FUNCTION_SEARCH)?;
    let (decoder, is_64bit) = open_decoder(provider)?;

    let mut result = json!({
        "arch": arch_name(is_64bit),
        "address": format_address(address),
    });
    match function_bounds(provider, &decoder, address, max_search)? {
        Some(bounds) => {
            result["found"] = json!(true);
            result["start"] = json!(format_address(bounds.start));
            result["end"] = json!(format_address(bounds.end));
            result["size"] = json!(bounds.size());
            result["method"] = json!(<&str>::from(bounds.method));
        }
        None => result["found"] = json!(false),
    }
    Ok(result)
}

/// Decode a whole function and list the calls it makes.
pub fn analyze_function(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let provider = state.provider.as_ref();
    let address = params.address("address", provider)?;
    let (decoder, is_64bit) = open_decoder(provider)?;
    let bounds = function_bounds(provider, &decoder, address, DEFAULT_FUNCTION_SEARCH)?
        .ok_or_else(|| {
            CommandError::Analysis(format!("no function found at {}", format_address(address)))
        })?;

    let code = provider.read_bytes(bounds.start, bounds.size() as usize)?;
    let mut offset = 0;
    let mut instruction_count = 0;
    let mut calls = vec![];
    while offset < code.len() {
        let current = bounds.start + offset as u64;
        let insn = decoder.decode(&code[offset..], current)?;
        offset += insn.size().max(1);
        instruction_count += 1;
        if mnemonic(&insn) != "call" {
            continue;
        }

        let target = insn
            .text
            .split_once(' ')
            .map(|(_, operand)| operand.trim())
            .filter(|operand| operand.starts_with("0x"))
            .and_then(parse_address_literal);
        let mut call = json!({
            "address": format_address(current),
            "instruction": insn.text,
            "indirect": target.is_none(),
        });
        if let Some(target) = target {
            call["target"] = json!(format_address(target));
            if let Some(label) = symbol_label(provider, target)? {
                call["symbol"] = json!(label);
            }
        }
        calls.push(call);
    }

    Ok(json!({
        "arch": arch_name(is_64bit),
        "function_start": format_address(bounds.start),
        "function_end": format_address(bounds.end),
        "size": bounds.size(),
        "instruction_count": instruction_count,
        "call_count": calls.len(),
        "calls": calls,
    }))
}

// --------------------------------- cross references ----------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
enum ReferenceKind {
    Call,
    Jump,
    Data,
}

#[derive(Clone, Debug, PartialEq)]
struct Reference {
    address: u64,
    instruction: String,
    kind: ReferenceKind,
}

impl Reference {
    fn new(insn: Instruction) -> Self {
        let kind = match mnemonic(&insn) {
            "call" => ReferenceKind::Call,
            m if m.starts_with('j') => ReferenceKind::Jump,
            _ => ReferenceKind::Data,
        };
        Self {
            address: insn.address,
            instruction: insn.text,
            kind,
        }
    }
}

/// First instruction starting at one of `starts` that `accept` takes.
fn decode_first(
    decoder: &Decoder,
    window: &[u8],
    base: u64,
    starts: Range<usize>,
    accept: impl Fn(usize, &Instruction) -> bool,
) -> Option<Instruction> {
    starts.into_iter().find_map(|s| {
        let insn = decoder.decode(&window[s..], base + s as u64).ok()?;
        accept(s, &insn).then_some(insn)
    })
}

/// Instructions of `window` referencing `target`, either through a 32-bit relative
/// displacement (branches, `rip`-relative operands) or an absolute address operand.
///
/// Only operand fields starting inside `fields` are considered, the rest of the window
/// supplies the instruction bytes around them.
fn references_in(
    decoder: &Decoder,
    window: &[u8],
    base: u64,
    fields: Range<usize>,
    target: u64,
    is_64bit: bool,
) -> Vec<Reference> {
    let target_text = format!("{target:#x}");

    let mut found = vec![];
    for field in fields {
        let Some(bytes) = window.get(field..field + 4) else {
            break;
        };
        let field_address = base + field as u64;
        let value = le_word(bytes);

        // relative: target = end of instruction + displacement, an immediate may follow
        let displacement = value as u32 as i32 as i64;
        let end = target.wrapping_sub(displacement as u64);
        if end >= field_address + 4 && end <= field_address + 8 {
            let end_offset = (end - base) as usize;
            let starts = end_offset.saturating_sub(MAX_INSTRUCTION_LEN)..field;
            let insn = decode_first(decoder, window, base, starts, |s, insn| {
                s + insn.size() == end_offset
                    && (insn.text.contains(&target_text)
                        || (is_64bit && rip_displacement(insn) == Some(field - s)))
            });
            if let Some(insn) = insn {
                found.push(Reference::new(insn));
                continue;
            }
        }

        let absolute = value == target
            || (is_64bit && window.get(field..field + 8).is_some_and(|w| le_word(w) == target));
        if absolute {
            let starts = (field + 1).saturating_sub(MAX_INSTRUCTION_LEN)..field;
            let insn = decode_first(decoder, window, base, starts, |s, insn| {
                s + insn.size() >= field + 4 && insn.text.contains(&target_text)
            });
            if let Some(insn) = insn {
                found.push(Reference::new(insn));
            }
        }
    }

    found.sort_by_key(|r| r.address);
    found.dedup_by_key(|r| r.address);
    found
}

/// Search every executable region for references to `target`, in address order.
fn find_references_to(
    provider: &dyn IntrospectionProvider,
    decoder: &Decoder,
    is_64bit: bool,
    target: u64,
    limit: usize,
    calls_only: bool,
) -> Result<Vec<Reference>, ProviderError> {
    let mut found: Vec<Reference> = vec![];
    let regions = provider.enumerate_regions()?;
    for region in regions.iter().filter(|r| r.protection.read && r.protection.execute) {
        let region_end = region.base.saturating_add(region.size);
        let mut chunk = region.base;
        while chunk < region_end {
            let chunk_end = chunk.saturating_add(REFERENCE_CHUNK as u64).min(region_end);
            // instruction bytes around the fields may lie outside the chunk
            let low = chunk
                .saturating_sub(MAX_INSTRUCTION_LEN as u64)
                .max(region.base);
            let high = chunk_end
                .saturating_add(MAX_INSTRUCTION_LEN as u64)
                .min(region_end);

            if let Some(window) =
                muted_error!(provider.read_bytes(low, (high - low) as usize), "reference scan read:")
            {
                let fields = (chunk - low) as usize..(chunk_end - low) as usize;
                for reference in references_in(decoder, &window, low, fields, target, is_64bit) {
                    if calls_only && reference.kind != ReferenceKind::Call {
                        continue;
                    }
                    if found.last().is_some_and(|last| last.address >= reference.address) {
                        continue;
                    }
                    found.push(reference);
                    if found.len() == limit {
                        return Ok(found);
                    }
                }
            }
            chunk = chunk_end;
        }
    }
    Ok(found)
}

fn reference_search(
    state: &mut BridgeState,
    params: &Params,
    default_limit: usize,
    calls_only: bool,
) -> HandlerResult {
    let provider = state.provider.as_ref();
    let target = params.address("address", provider)?;
    let limit = bounded(params, "limit", default_limit, MAX_REFERENCE_LIMIT)?;
    let (decoder, is_64bit) = open_decoder(provider)?;

    let references = find_references_to(provider, &decoder, is_64bit, target, limit, calls_only)?;
    let references: Vec<Value> = references
        .into_iter()
        .map(|r| {
            json!({
                "address": format_address(r.address),
                "instruction": r.instruction,
                "type": <&str>::from(r.kind),
            })
        })
        .collect();
    Ok(json!({
        "arch": arch_name(is_64bit),
        "address": format_address(target),
        "count": references.len(),
        "references": references,
    }))
}

/// Code referencing an address: branches to it and instructions using it as an operand.
pub fn find_references(state: &mut BridgeState, params: &Params) -> HandlerResult {
    reference_search(state, params, DEFAULT_REFERENCE_LIMIT, false)
}

pub fn find_call_references(state: &mut BridgeState, params: &Params) -> HandlerResult {
    reference_search(state, params, DEFAULT_CALL_REFERENCE_LIMIT, true)
}

// --------------------------------- signatures ----------------------------------------------------

/// Instruction bytes with the position-dependent parts replaced by wildcards.
fn signature_bytes(insn: &Instruction) -> Vec<Option<u8>> {
    let mut bytes: Vec<Option<u8>> = insn.bytes.iter().copied().map(Some).collect();
    let relative = match insn.bytes.as_slice() {
        [0xe8 | 0xe9, _, _, _, _] => Some(1),
        [0x0f, 0x80..=0x8f, _, _, _, _] => Some(2),
        _ => rip_displacement(insn),
    };
    if let Some(offset) = relative {
        let end = (offset + 4).min(bytes.len());
        bytes[offset..end].fill(None);
    }
    bytes
}

/// Shortest instruction-aligned byte pattern that matches only at `address`.
pub fn generate_signature(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let address = params.address("address", state.provider.as_ref())?;
    let region =
        region_of(state.provider.as_ref(), address)?.ok_or(ProviderError::Unmapped(address))?;
    let filter = ProtectionFilter {
        executable: region.protection.execute.then_some(true),
        ..ProtectionFilter::default()
    };

    let mut bytes = vec![];
    let mut current = address;
    for _ in 0..MAX_SIGNATURE_INSTRUCTIONS {
        let insn = state.provider.disassemble_one(current)?;
        current += insn.size().max(1) as u64;
        bytes.extend(signature_bytes(&insn));
        if bytes.len() > MAX_SIGNATURE_LEN {
            break;
        }
        if bytes.len() < MIN_SIGNATURE_LEN {
            continue;
        }

        let pattern = BytePattern::with_wildcards(bytes.clone());
        let page = one_shot(state.provider.as_mut(), 2, |provider| {
            provider.scan_pattern(&pattern, &filter)
        })?;
        if page.total == 1 {
            return Ok(json!({
                "address": format_address(address),
                "signature": pattern.to_string(),
                "length": pattern.len(),
                "unique": true,
            }));
        }
    }

    Err(CommandError::Analysis(format!(
        "no unique signature within {MAX_SIGNATURE_LEN} bytes at {}",
        format_address(address)
    )))
}

// --------------------------------- structures ----------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum FieldValue {
    Pointer(u64),
    Text(String),
    Float(f32),
    Dword(u32),
    Byte(u8),
}

#[derive(Clone, Debug, PartialEq)]
struct Field {
    offset: usize,
    size: usize,
    value: FieldValue,
}

/// Guess the field at the start of `rest`. Pointers win over strings, strings over floats,
/// everything else is a dword (or a byte at the tail).
fn guess_field(rest: &[u8], offset: usize, pointer_size: usize, is_pointer: &dyn Fn(u64) -> bool) -> Field {
    if offset % pointer_size == 0 && rest.len() >= pointer_size {
        let value = le_word(&rest[..pointer_size]);
        if value != 0 && is_pointer(value) {
            return Field {
                offset,
                size: pointer_size,
                value: FieldValue::Pointer(value),
            };
        }
    }

    let text_len = rest
        .iter()
        .take_while(|b| b.is_ascii_graphic() || **b == b' ')
        .count();
    if text_len >= MIN_STRING_LEN {
        return Field {
            offset,
            size: (text_len + 1).next_multiple_of(4).min(rest.len()),
            value: FieldValue::Text(String::from_utf8_lossy(&rest[..text_len]).into_owned()),
        };
    }

    if rest.len() < 4 {
        return Field {
            offset,
            size: 1,
            value: FieldValue::Byte(rest[0]),
        };
    }
    let dword = le_word(&rest[..4]) as u32;
    let float = f32::from_bits(dword);
    let value = if float.is_normal() && (1e-3..=1e7).contains(&float.abs()) {
        FieldValue::Float(float)
    } else {
        FieldValue::Dword(dword)
    };
    Field {
        offset,
        size: 4,
        value,
    }
}

fn dissect(data: &[u8], pointer_size: usize, is_pointer: &dyn Fn(u64) -> bool) -> Vec<Field> {
    let mut fields = vec![];
    let mut offset = 0;
    while offset < data.len() {
        let field = guess_field(&data[offset..], offset, pointer_size, is_pointer);
        offset += field.size;
        fields.push(field);
    }
    fields
}

/// Guess the layout of a structure from its memory.
pub fn dissect_structure(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let provider = state.provider.as_ref();
    let address = params.address("address", provider)?;
    let size = bounded(params, "size", DEFAULT_STRUCTURE_SIZE, MAX_STRUCTURE_SIZE)?;

    let data = provider.read_bytes(address, size)?;
    let regions = provider.enumerate_regions()?;
    let is_pointer = |value: u64| {
        regions
            .iter()
            .any(|r| r.protection.read && value >= r.base && value - r.base < r.size)
    };

    let mut elements = vec![];
    for field in dissect(&data, provider.pointer_size(), &is_pointer) {
        let mut element = json!({
            "offset": field.offset,
            "size": field.size,
        });
        let (kind, value) = match field.value {
            FieldValue::Pointer(pointer) => {
                if let Some(label) = symbol_label(provider, pointer)? {
                    element["symbol"] = json!(label);
                }
                ("pointer", json!(format_address(pointer)))
            }
            FieldValue::Text(text) => ("string", json!(text)),
            FieldValue::Float(float) => ("float", json!(float)),
            FieldValue::Dword(dword) => ("dword", json!(dword)),
            FieldValue::Byte(byte) => ("byte", json!(byte)),
        };
        element["type"] = json!(kind);
        element["value"] = value;
        elements.push(element);
    }

    Ok(json!({
        "base_address": format_address(address),
        "size_analyzed": data.len(),
        "element_count": elements.len(),
        "elements": elements,
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dispatch::test::{call, sim_state};

    #[test]
    fn test_function_boundaries() {
        let (mut state, _) = sim_state();

        struct TestCase {
            address: &'static str,
            expected: Value,
        }
        let cases = [
            TestCase {
                address: "0x401011",
                expected: json!({"start": "0x401000", "end": "0x40101C", "size": 28, "method": "padding"}),
            },
            TestCase {
                address: "main",
                expected: json!({"start": "0x401000", "end": "0x40101C", "size": 28, "method": "padding"}),
            },
            TestCase {
                address: "update_player+9",
                expected: json!({"start": "0x401100", "end": "0x401114", "size": 20, "method": "prologue"}),
            },
        ];
        for tc in cases {
            let result = call(&mut state, "find_function_boundaries", json!({"address": tc.address}));
            assert_eq!(result["found"], json!(true), "{}", tc.address);
            assert_eq!(result["arch"], json!("x64"));
            for key in ["start", "end", "size", "method"] {
                assert_eq!(result[key], tc.expected[key], "{} {key}", tc.address);
            }
        }

        // padding between the two functions
        let result = call(&mut state, "find_function_boundaries", json!({"address": "0x401800"}));
        assert_eq!(result["success"], json!(true));
        assert_eq!(result["found"], json!(false));

        let unmapped = call(&mut state, "find_function_boundaries", json!({"address": "0x10"}));
        assert_eq!(unmapped["success"], json!(false));

        let invalid = call(
            &mut state,
            "find_function_boundaries",
            json!({"address": "main", "max_search": 0}),
        );
        assert_eq!(invalid["success"], json!(false));
    }

    #[test]
    fn test_analyze_function() {
        let (mut state, _) = sim_state();

        let result = call(&mut state, "analyze_function", json!({"address": "update_player"}));
        assert_eq!(result["success"], json!(true));
        assert_eq!(result["function_start"], json!("0x401100"));
        assert_eq!(result["function_end"], json!("0x401114"));
        assert_eq!(result["instruction_count"], json!(7));
        assert_eq!(result["call_count"], json!(2));

        let calls = result["calls"].as_array().unwrap();
        assert_eq!(calls[0]["address"], json!("0x401104"));
        assert_eq!(calls[0]["instruction"], json!("call 0x401000"));
        assert_eq!(calls[0]["target"], json!("0x401000"));
        assert_eq!(calls[0]["symbol"], json!("main"));
        assert_eq!(calls[0]["indirect"], json!(false));
        assert_eq!(calls[1]["instruction"], json!("call rax"));
        assert_eq!(calls[1]["indirect"], json!(true));
        assert!(calls[1].get("target").is_none());

        let leaf = call(&mut state, "analyze_function", json!({"address": "main"}));
        assert_eq!(leaf["instruction_count"], json!(7));
        assert_eq!(leaf["call_count"], json!(0));

        let none = call(&mut state, "analyze_function", json!({"address": "0x401800"}));
        assert_eq!(none["success"], json!(false));
        assert_eq!(none["error"], json!("no function found at 0x401800"));
    }

    #[test]
    fn test_find_references() {
        let (mut state, _) = sim_state();

        let result = call(&mut state, "find_references", json!({"address": "player_health"}));
        assert_eq!(result["count"], json!(3));
        let references = result["references"].as_array().unwrap();
        let addresses: Vec<&str> = references
            .iter()
            .map(|r| r["address"].as_str().unwrap())
            .collect();
        assert_eq!(addresses, vec!["0x401009", "0x401011", "0x401109"]);
        assert!(references.iter().all(|r| r["type"] == "data"));
        assert_eq!(
            references[0]["instruction"],
            json!("mov eax, dword ptr [rip + 0xff031]")
        );

        let limited = call(&mut state, "find_references", json!({"address": "player_health", "limit": 2}));
        assert_eq!(limited["count"], json!(2));

        let result = call(&mut state, "find_references", json!({"address": "main"}));
        assert_eq!(result["count"], json!(1));
        assert_eq!(result["references"][0]["type"], json!("call"));

        let result = call(&mut state, "find_references", json!({"address": "guild_name"}));
        assert_eq!(result["success"], json!(true));
        assert_eq!(result["count"], json!(0));
    }

    #[test]
    fn test_find_call_references() {
        let (mut state, _) = sim_state();

        let result = call(&mut state, "find_call_references", json!({"address": "main"}));
        assert_eq!(result["count"], json!(1));
        assert_eq!(result["references"][0]["address"], json!("0x401104"));
        assert_eq!(result["references"][0]["instruction"], json!("call 0x401000"));

        // data references are not calls
        let result = call(&mut state, "find_call_references", json!({"address": "player_health"}));
        assert_eq!(result["count"], json!(0));
    }

    #[test]
    fn test_references_in_window() {
        let decoder = Decoder::new(false).unwrap();
        // 32-bit: mov eax, [0x500040]; jmp 0x1000; nop
        let code = [0xa1, 0x40, 0x00, 0x50, 0x00, 0xe9, 0xf6, 0xff, 0xff, 0xff, 0x90];

        let found = references_in(&decoder, &code, 0x1000, 0..code.len(), 0x500040, false);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, 0x1000);
        assert_eq!(found[0].kind, ReferenceKind::Data);

        let found = references_in(&decoder, &code, 0x1000, 0..code.len(), 0x1000, false);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, 0x1005);
        assert_eq!(found[0].kind, ReferenceKind::Jump);

        // fields outside the given range are ignored
        let found = references_in(&decoder, &code, 0x1000, 0..5, 0x1000, false);
        assert!(found.is_empty());
    }

    #[test]
    fn test_generate_signature() {
        let (mut state, sim) = sim_state();

        struct TestCase {
            address: &'static str,
            signature: &'static str,
        }
        let cases = [
            TestCase {
                address: "main",
                signature: "48 89 5C 24 08",
            },
            TestCase {
                address: "0x401109",
                signature: "48 8B 05 ?? ?? ?? ??",
            },
            TestCase {
                address: "update_player",
                signature: "55 48 89 E5 E8 ?? ?? ?? ??",
            },
        ];
        for tc in cases {
            let result = call(&mut state, "generate_signature", json!({"address": tc.address}));
            assert_eq!(result["signature"], json!(tc.signature), "{}", tc.address);
            assert_eq!(result["unique"], json!(true));

            let found = call(&mut state, "aob_scan", json!({"pattern": tc.signature}));
            assert_eq!(found["count"], json!(1), "{}", tc.address);
        }
        assert_eq!(sim.live_scans(), 0);

        let padding = call(&mut state, "generate_signature", json!({"address": "0x401800"}));
        assert_eq!(padding["success"], json!(false));
    }

    #[test]
    fn test_signature_wildcards() {
        let insn = |bytes: &[u8], text: &str| Instruction {
            address: 0x1000,
            bytes: bytes.to_vec(),
            text: text.to_string(),
        };

        struct TestCase {
            insn: Instruction,
            expected: &'static str,
        }
        let cases = [
            TestCase {
                insn: insn(&[0xe8, 1, 2, 3, 4], "call 0x5040306"),
                expected: "E8 ?? ?? ?? ??",
            },
            TestCase {
                insn: insn(&[0x0f, 0x84, 1, 2, 3, 4], "je 0x5040307"),
                expected: "0F 84 ?? ?? ?? ??",
            },
            TestCase {
                insn: insn(
                    &[0x48, 0x8b, 0x05, 0xf0, 0xff, 0xff, 0xff],
                    "mov rax, qword ptr [rip - 0x10]",
                ),
                expected: "48 8B 05 ?? ?? ?? ??",
            },
            TestCase {
                insn: insn(&[0x48, 0x83, 0xec, 0x20], "sub rsp, 0x20"),
                expected: "48 83 EC 20",
            },
        ];
        for tc in cases {
            let pattern = BytePattern::with_wildcards(signature_bytes(&tc.insn));
            assert_eq!(pattern.to_string(), tc.expected, "{}", tc.insn.text);
        }
    }

    #[test]
    fn test_dissect_structure() {
        let (mut state, sim) = sim_state();

        let mut data = vec![];
        data.extend(1.5f32.to_le_bytes());
        data.extend(100u32.to_le_bytes());
        data.extend(0x500200u64.to_le_bytes());
        data.extend(b"Hero\0\0\0\0");
        data.extend([0; 8]);
        sim.write_bytes(0x500600, &data).unwrap();

        let result = call(&mut state, "dissect_structure", json!({"address": "0x500600", "size": 32}));
        assert_eq!(result["base_address"], json!("0x500600"));
        assert_eq!(result["size_analyzed"], json!(32));
        assert_eq!(result["element_count"], json!(6));

        let elements = result["elements"].as_array().unwrap();
        let layout: Vec<(u64, &str)> = elements
            .iter()
            .map(|e| (e["offset"].as_u64().unwrap(), e["type"].as_str().unwrap()))
            .collect();
        assert_eq!(
            layout,
            vec![
                (0, "float"),
                (4, "dword"),
                (8, "pointer"),
                (16, "string"),
                (24, "dword"),
                (28, "dword"),
            ]
        );
        assert_eq!(elements[0]["value"], json!(1.5));
        assert_eq!(elements[1]["value"], json!(100));
        assert_eq!(elements[2]["value"], json!("0x500200"));
        assert_eq!(elements[2]["symbol"], json!("player_name"));
        assert_eq!(elements[3]["value"], json!("Hero"));

        let too_large = call(&mut state, "dissect_structure", json!({"address": "0x500600", "size": 1 << 20}));
        assert_eq!(too_large["success"], json!(false));
    }

    #[test]
    fn test_dissect_tail_bytes() {
        let fields = dissect(&[1, 0, 0, 0, 7, 8], 8, &|_| false);
        assert_eq!(
            fields,
            vec![
                Field {
                    offset: 0,
                    size: 4,
                    value: FieldValue::Dword(1)
                },
                Field {
                    offset: 4,
                    size: 1,
                    value: FieldValue::Byte(7)
                },
                Field {
                    offset: 5,
                    size: 1,
                    value: FieldValue::Byte(8)
                },
            ]
        );
    }
}
