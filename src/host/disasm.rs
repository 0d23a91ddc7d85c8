use crate::provider::{Instruction, ProviderError};
use capstone::prelude::*;

/// Longest possible x86 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

fn capstone(is_64bit: bool) -> Result<Capstone, ProviderError> {
    let mode = if is_64bit {
        arch::x86::ArchMode::Mode64
    } else {
        arch::x86::ArchMode::Mode32
    };
    Capstone::new()
        .x86()
        .mode(mode)
        .syntax(arch::x86::ArchSyntax::Intel)
        .build()
        .map_err(|e| ProviderError::DisAsmInit(e.to_string()))
}

/// Capstone instance reused across a sweep over many instructions.
pub struct Decoder {
    cs: Capstone,
}

impl Decoder {
    pub fn new(is_64bit: bool) -> Result<Self, ProviderError> {
        Ok(Self {
            cs: capstone(is_64bit)?,
        })
    }

    /// Decode the first instruction of `code`, located at `address` in the target.
    pub fn decode(&self, code: &[u8], address: u64) -> Result<Instruction, ProviderError> {
        let instructions = self
            .cs
            .disasm_count(code, address, 1)
            .map_err(|_| ProviderError::Disassembly(address))?;
        let insn = instructions
            .iter()
            .next()
            .ok_or(ProviderError::Disassembly(address))?;

        let text = match (insn.mnemonic(), insn.op_str()) {
            (Some(mnemonic), Some(operands)) if !operands.is_empty() => {
                format!("{mnemonic} {operands}")
            }
            (Some(mnemonic), _) => mnemonic.to_string(),
            (None, _) => return Err(ProviderError::Disassembly(address)),
        };

        Ok(Instruction {
            address,
            bytes: insn.bytes().to_vec(),
            text,
        })
    }
}

/// Decode the first instruction of `code`, located at `address` in the target.
pub fn disassemble_one(code: &[u8], address: u64, is_64bit: bool) -> Result<Instruction, ProviderError> {
    Decoder::new(is_64bit)?.decode(code, address)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_disassemble_one() {
        struct TestCase {
            code: &'static [u8],
            text: &'static str,
            size: usize,
        }

        let cases = [
            TestCase {
                code: &[0x48, 0x89, 0x5c, 0x24, 0x08, 0xc3],
                text: "mov qword ptr [rsp + 8], rbx",
                size: 5,
            },
            TestCase {
                code: &[0xc3, 0x90],
                text: "ret",
                size: 1,
            },
            TestCase {
                code: &[0xff, 0xc0],
                text: "inc eax",
                size: 2,
            },
        ];

        for tc in cases {
            let insn = disassemble_one(tc.code, 0x401000, true).unwrap();
            assert_eq!(insn.text, tc.text);
            assert_eq!(insn.size(), tc.size);
            assert_eq!(insn.address, 0x401000);
        }
    }

    #[test]
    fn test_undecodable() {
        assert!(matches!(
            disassemble_one(&[0x0f], 0x1000, true),
            Err(ProviderError::Disassembly(0x1000))
        ));
    }

    #[test]
    fn test_decoder_sweep() {
        let code = [0x55, 0x48, 0x89, 0xe5, 0x5d, 0xc3];
        let decoder = Decoder::new(true).unwrap();

        let mut offset = 0;
        let mut texts = vec![];
        while offset < code.len() {
            let insn = decoder.decode(&code[offset..], 0x1000 + offset as u64).unwrap();
            offset += insn.size();
            texts.push(insn.text);
        }
        assert_eq!(texts, vec!["push rbp", "mov rbp, rsp", "pop rbp", "ret"]);

        let decoder = Decoder::new(false).unwrap();
        assert_eq!(decoder.decode(&[0x55, 0x8b, 0xec], 0x1000).unwrap().text, "push ebp");
    }
}
