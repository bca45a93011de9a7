//! Instruction set: opcodes, decoding, and body verification.

mod decoder;
mod opcode;
mod verifier;

use std::fmt;

use crate::metadata::Token;

pub use decoder::{decode, IlDecoder};
pub use opcode::{op, OpCode};
pub use verifier::{VerifyError, Verifier};

/// Immediate operand of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Int(i32),
    /// Argument or local slot.
    Index(u16),
    /// Absolute branch target offset.
    Target(u32),
    Token(Token),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub offset: u32,
    pub opcode: OpCode,
    pub operand: Option<Operand>,
}

impl Instruction {
    pub fn new(offset: u32, opcode: OpCode, operand: Option<Operand>) -> Self {
        Self { offset, opcode, operand }
    }

    pub fn target(&self) -> Option<u32> {
        match self.operand {
            Some(Operand::Target(t)) => Some(t),
            _ => None,
        }
    }

    pub fn token(&self) -> Option<Token> {
        match self.operand {
            Some(Operand::Token(t)) => Some(t),
            _ => None,
        }
    }

    pub fn index(&self) -> Option<usize> {
        match self.operand {
            Some(Operand::Index(i)) => Some(i as usize),
            _ => None,
        }
    }

    pub fn int(&self) -> Option<i32> {
        match self.operand {
            Some(Operand::Int(n)) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04X}: {}", self.offset, self.opcode.name())?;
        match self.operand {
            Some(Operand::Int(n)) => write!(f, " {}", n),
            Some(Operand::Index(i)) => write!(f, " {}", i),
            Some(Operand::Target(t)) => write!(f, " IL_{:04X}", t),
            Some(Operand::Token(t)) => write!(f, " {}", t),
            None => Ok(()),
        }
    }
}
