use std::collections::HashMap;

use crate::error::VmError;
use crate::il::Instruction;
use crate::metadata::{ExceptionRegion, Token};

use super::Value;

/// Execution state of one in-flight call.
#[derive(Debug)]
pub struct Frame {
    pub method: Token,
    pub instructions: Vec<Instruction>,
    /// Instruction offset to index, for branch resolution.
    offsets: HashMap<u32, usize>,
    pub regions: Vec<ExceptionRegion>,
    pub args: Vec<Value>,
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
    pub ip: usize,
}

impl Frame {
    pub fn new(
        method: Token,
        instructions: Vec<Instruction>,
        regions: Vec<ExceptionRegion>,
        args: Vec<Value>,
        local_count: usize,
    ) -> Self {
        let offsets = instructions
            .iter()
            .enumerate()
            .map(|(i, instr)| (instr.offset, i))
            .collect();
        Self {
            method,
            instructions,
            offsets,
            regions,
            args,
            locals: vec![Value::Null; local_count],
            stack: Vec::new(),
            ip: 0,
        }
    }

    /// Map a branch target to an instruction index.
    pub fn index_of(&self, target: u32) -> Result<usize, VmError> {
        self.offsets
            .get(&target)
            .copied()
            .ok_or_else(|| VmError::InvalidBranchTarget {
                offset: self.current_offset(),
                target,
            })
    }

    pub fn current_offset(&self) -> u32 {
        self.instructions.get(self.ip).map(|i| i.offset).unwrap_or(0)
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or_else(|| {
            VmError::MalformedBody(format!("stack underflow at IL_{:04X}", self.current_offset()))
        })
    }

    pub fn peek(&self) -> Result<&Value, VmError> {
        self.stack.last().ok_or_else(|| {
            VmError::MalformedBody(format!("stack underflow at IL_{:04X}", self.current_offset()))
        })
    }

    /// Pop `count` values, returned in push order.
    pub fn pop_args(&mut self, count: usize) -> Result<Vec<Value>, VmError> {
        if self.stack.len() < count {
            return Err(VmError::MalformedBody(format!(
                "stack underflow at IL_{:04X}: need {} values, have {}",
                self.current_offset(),
                count,
                self.stack.len()
            )));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn slot<'a>(slots: &'a mut [Value], index: usize, kind: &str, offset: u32) -> Result<&'a mut Value, VmError> {
        let count = slots.len();
        slots.get_mut(index).ok_or_else(|| {
            VmError::MalformedBody(format!(
                "{} index {} at IL_{:04X} is out of range (count {})",
                kind, index, offset, count
            ))
        })
    }

    pub fn arg(&mut self, index: usize) -> Result<&mut Value, VmError> {
        let offset = self.current_offset();
        Self::slot(&mut self.args, index, "argument", offset)
    }

    pub fn local(&mut self, index: usize) -> Result<&mut Value, VmError> {
        let offset = self.current_offset();
        Self::slot(&mut self.locals, index, "local", offset)
    }

    /// Every value this frame keeps alive.
    pub fn roots(&self) -> impl Iterator<Item = &Value> {
        self.args.iter().chain(self.locals.iter()).chain(self.stack.iter())
    }
}
