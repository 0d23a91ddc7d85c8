use crate::address::format_address;
use crate::bridge::BridgeState;
use crate::dispatch::memory::hex_dump;
use crate::dispatch::params::Params;
use crate::dispatch::{CommandError, HandlerResult};
use crate::provider::Instruction;
use crate::weak_error;
use serde_json::{json, Value};

const DEFAULT_INSTRUCTION_COUNT: usize = 20;
const MAX_INSTRUCTION_COUNT: usize = 4096;

fn instruction_json(insn: &Instruction) -> Value {
    json!({
        "address": format_address(insn.address),
        "bytes": hex_dump(&insn.bytes),
        "size": insn.size(),
        "instruction": insn.text,
    })
}

/// Linear sweep from `address`. Stops early at the first undecodable instruction.
pub fn disassemble(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let address = params.address("address", state.provider.as_ref())?;
    let count = params.usize_or("count", DEFAULT_INSTRUCTION_COUNT)?;
    if count > MAX_INSTRUCTION_COUNT {
        return Err(CommandError::InvalidParam {
            name: "count",
            reason: format!("at most {MAX_INSTRUCTION_COUNT} instructions per request"),
        });
    }

    let mut instructions = vec![];
    let mut current = address;
    for i in 0..count {
        let insn = if i == 0 {
            // nothing decodable at the start address is an error of the command
            state.provider.disassemble_one(current)?
        } else {
            match weak_error!(state.provider.disassemble_one(current), "disassemble:") {
                Some(insn) => insn,
                None => break,
            }
        };
        current += insn.size().max(1) as u64;
        instructions.push(instruction_json(&insn));
    }

    Ok(json!({
        "address": format_address(address),
        "count": instructions.len(),
        "instructions": instructions,
    }))
}

pub fn get_instruction_info(state: &mut BridgeState, params: &Params) -> HandlerResult {
    let address = params.address("address", state.provider.as_ref())?;
    let insn = state.provider.disassemble_one(address)?;
    let mnemonic = insn.text.split_whitespace().next().unwrap_or_default();
    Ok(json!({
        "address": format_address(address),
        "size": insn.size(),
        "bytes": hex_dump(&insn.bytes),
        "instruction": insn.text,
        "mnemonic": mnemonic,
        "next_address": format_address(address + insn.size() as u64),
    }))
}
