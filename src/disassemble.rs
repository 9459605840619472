//! # Disassembly Module
//!
//! Decodes the instructions a stomp hook displaces.
//!
//! A stomp hook overwrites a fixed number of bytes at its target. If the last overwritten
//! instruction extends past the jump stub, a trampoline cannot resume the original code by
//! re-executing the saved bytes. [`DisplacedCode`] uses iced-x86 to find out whether the
//! stub ends on an instruction boundary and formats the displaced instructions for logging.

use std::fmt::Display;

use iced_x86::{Decoder, DecoderError, DecoderOptions, Formatter, Instruction, NasmFormatter};
use serde::Serialize;

use crate::addr::Addr;

#[cfg(target_pointer_width = "64")]
const CODE_BITNESS: u32 = 64;
#[cfg(target_pointer_width = "32")]
const CODE_BITNESS: u32 = 32;

/// The instructions contained in a range of displaced code
#[derive(Debug, Clone, Serialize)]
pub struct DisplacedCode {
    /// Address and formatted text of every complete instruction
    pub instructions: Vec<(Addr, String)>,
    /// Number of bytes covered by complete instructions
    pub complete_len: usize,
    /// Number of bytes that were analyzed
    pub code_len: usize,
    /// Whether the last instruction continues past the analyzed bytes
    pub splits_instruction: bool,
}

impl DisplacedCode {
    /// Decodes `code`, which starts at `first_addr`
    pub fn analyze(code: &[u8], first_addr: Addr) -> Self {
        let mut decoder = Decoder::with_ip(CODE_BITNESS, code, first_addr.u64(), DecoderOptions::NONE);
        let mut formatter = NasmFormatter::new();
        formatter.options_mut().set_hex_suffix("");
        formatter.options_mut().set_hex_prefix("0x");

        let mut instruction = Instruction::default();
        let mut text = String::new();
        let mut instructions = Vec::new();
        let mut complete_len = 0;
        let mut splits_instruction = false;

        while decoder.can_decode() {
            decoder.decode_out(&mut instruction);
            if instruction.is_invalid() {
                splits_instruction = decoder.last_error() == DecoderError::NoMoreBytes;
                break;
            }
            text.clear();
            formatter.format(&instruction, &mut text);
            instructions.push((Addr::from(instruction.ip()), text.clone()));
            complete_len += instruction.len();
        }

        Self {
            instructions,
            complete_len,
            code_len: code.len(),
            splits_instruction,
        }
    }

    /// Whether the analyzed bytes consist of complete instructions only
    pub fn ends_on_boundary(&self) -> bool {
        self.complete_len == self.code_len
    }
}

impl Display for DisplacedCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (addr, text) in &self.instructions {
            writeln!(f, "{addr}\t{text}")?;
        }
        if !self.ends_on_boundary() {
            writeln!(
                f,
                "({} trailing bytes are not a complete instruction)",
                self.code_len - self.complete_len
            )?;
        }
        Ok(())
    }
}
