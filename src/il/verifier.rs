//! Method body verifier.
//!
//! Checks structural rules the interpreter otherwise only discovers while
//! running:
//! - Control flow: branch targets must be instruction boundaries
//! - Exception regions: try and handler starts must be instruction boundaries
//! - Slots: argument and local indices must be in range

use std::collections::HashSet;

use thiserror::Error;

use super::{Instruction, OpCode};
use crate::error::VmError;
use crate::metadata::ExceptionRegion;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerifyError {
    #[error("invalid branch target at IL_{offset:04X}: IL_{target:04X} is not an instruction boundary")]
    InvalidBranchTarget { offset: u32, target: u32 },
    #[error("exception region {index} {what} offset IL_{offset:04X} is not an instruction boundary")]
    InvalidRegion {
        index: usize,
        what: &'static str,
        offset: u32,
    },
    #[error("{kind} index {index} at IL_{offset:04X} is out of range (count {count})")]
    SlotOutOfRange {
        offset: u32,
        kind: &'static str,
        index: usize,
        count: usize,
    },
}

impl From<VerifyError> for VmError {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::InvalidBranchTarget { offset, target } => {
                VmError::InvalidBranchTarget { offset, target }
            }
            other => VmError::MalformedBody(other.to_string()),
        }
    }
}

/// Structural verifier for decoded bodies.
#[derive(Debug, Clone, Copy)]
pub struct Verifier {
    pub arg_count: usize,
    pub local_count: usize,
}

impl Verifier {
    pub fn new(arg_count: usize, local_count: usize) -> Self {
        Self { arg_count, local_count }
    }

    pub fn verify(&self, instructions: &[Instruction], regions: &[ExceptionRegion]) -> Result<(), VerifyError> {
        let boundaries: HashSet<u32> = instructions.iter().map(|i| i.offset).collect();

        for instr in instructions {
            if let Some(target) = instr.target()
                && !boundaries.contains(&target)
            {
                return Err(VerifyError::InvalidBranchTarget {
                    offset: instr.offset,
                    target,
                });
            }
            self.check_slot(instr)?;
        }

        for (index, region) in regions.iter().enumerate() {
            for (what, offset) in [("try", region.try_offset), ("handler", region.handler_offset)] {
                if !boundaries.contains(&offset) {
                    return Err(VerifyError::InvalidRegion { index, what, offset });
                }
            }
        }
        Ok(())
    }

    fn check_slot(&self, instr: &Instruction) -> Result<(), VerifyError> {
        let (kind, count) = match instr.opcode {
            OpCode::Ldarg | OpCode::Starg => ("argument", self.arg_count),
            OpCode::Ldloc | OpCode::Stloc => ("local", self.local_count),
            _ => return Ok(()),
        };
        match instr.index() {
            Some(index) if index >= count => Err(VerifyError::SlotOutOfRange {
                offset: instr.offset,
                kind,
                index,
                count,
            }),
            _ => Ok(()),
        }
    }
}
