//! Programmatic construction of [`ProgramImage`]s.
//!
//! [`ImageBuilder`] hands out tokens as rows are added, so bodies can refer
//! to methods declared later. [`IlEmitter`] writes IL bytes and patches
//! branch deltas once their [`Label`]s are bound.

use super::image::{FieldEntry, MemberRefEntry, MethodEntry, TypeEntry, TypeRefEntry};
use super::{table, ExceptionRegion, MethodSignature, ProgramImage, RegionKind, Token};
use crate::error::VmError;
use crate::il::op;

#[derive(Debug, Default)]
pub struct ImageBuilder {
    image: ProgramImage,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn type_def(&mut self, namespace: &str, name: &str) -> Token {
        self.image.types.push(TypeEntry {
            namespace: namespace.to_string(),
            name: name.to_string(),
            extends: None,
        });
        Token::new(table::TYPE_DEF, self.image.types.len() as u32)
    }

    /// Record `base` (a qualified name) as the base type of `ty`.
    pub fn extends(&mut self, ty: Token, base: &str) -> &mut Self {
        if let Some(entry) = ty.index().and_then(|i| self.image.types.get_mut(i)) {
            entry.extends = Some(base.to_string());
        }
        self
    }

    pub fn type_ref(&mut self, namespace: &str, name: &str) -> Token {
        self.image.type_refs.push(TypeRefEntry {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Token::new(table::TYPE_REF, self.image.type_refs.len() as u32)
    }

    pub fn field(&mut self, owner: Token, name: &str) -> Token {
        self.image.fields.push(FieldEntry {
            owner,
            name: name.to_string(),
        });
        Token::new(table::FIELD, self.image.fields.len() as u32)
    }

    /// Declare a method with an empty body; fill it in with [`Self::body`].
    pub fn method(&mut self, owner: Token, name: &str, signature: MethodSignature) -> Token {
        self.image.methods.push(MethodEntry {
            owner,
            name: name.to_string(),
            signature,
            locals: 0,
            code: Vec::new(),
            regions: Vec::new(),
        });
        Token::new(table::METHOD_DEF, self.image.methods.len() as u32)
    }

    pub fn body(&mut self, method: Token, locals: usize, il: IlEmitter) -> Result<&mut Self, VmError> {
        let (code, regions) = il.finish()?;
        let entry = method
            .index()
            .and_then(|i| self.image.methods.get_mut(i))
            .ok_or_else(|| VmError::Image(format!("no method declared for {}", method)))?;
        entry.locals = locals;
        entry.code = code;
        entry.regions = regions;
        Ok(self)
    }

    pub fn member_ref(&mut self, parent: Token, name: &str, signature: Option<MethodSignature>) -> Token {
        self.image.member_refs.push(MemberRefEntry {
            parent,
            name: name.to_string(),
            signature,
        });
        Token::new(table::MEMBER_REF, self.image.member_refs.len() as u32)
    }

    pub fn user_string(&mut self, value: &str) -> Token {
        self.image.strings.push(value.to_string());
        Token::new(table::USER_STRING, self.image.strings.len() as u32)
    }

    pub fn entry_point(&mut self, method: Token) -> &mut Self {
        self.image.entry_point = method;
        self
    }

    pub fn build(self) -> ProgramImage {
        self.image
    }
}

/// A position in the IL stream, bound with [`IlEmitter::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
struct Fixup {
    /// Position of the delta bytes.
    at: usize,
    /// Offset right after the branch (base for the delta).
    base: usize,
    label: Label,
    wide: bool,
}

#[derive(Debug)]
struct PendingRegion {
    kind: RegionKind,
    try_start: Label,
    try_end: Label,
    handler_start: Label,
    handler_end: Label,
    catch_type: Option<Token>,
}

/// Writes IL bytes.
#[derive(Debug, Default)]
pub struct IlEmitter {
    buf: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    regions: Vec<PendingRegion>,
}

impl IlEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current byte offset in the IL stream.
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current offset.
    pub fn mark(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.buf.len());
        self
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit a raw one-byte opcode with no operand.
    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.emit_u8(opcode);
        self
    }

    /// Emit a two-byte opcode with no operand.
    pub fn op_ext(&mut self, opcode: u8) -> &mut Self {
        self.emit_u8(op::PREFIX);
        self.emit_u8(opcode);
        self
    }

    pub fn with_token(&mut self, opcode: u8, token: Token) -> &mut Self {
        self.emit_u8(opcode);
        self.emit_i32(token.0 as i32);
        self
    }

    // ── instructions ───────────────────────────────────────────────

    pub fn ldc_i4(&mut self, value: i32) -> &mut Self {
        match value {
            -1..=8 => self.emit_u8((op::LDC_I4_0 as i32 + value) as u8),
            -128..=127 => {
                self.emit_u8(op::LDC_I4_S);
                self.emit_u8(value as i8 as u8);
            }
            _ => {
                self.emit_u8(op::LDC_I4);
                self.emit_i32(value);
            }
        }
        self
    }

    fn slot(&mut self, index: u16, macro_base: Option<u8>, short: u8, long: u8) -> &mut Self {
        match (macro_base, index) {
            (Some(base), 0..=3) => self.emit_u8(base + index as u8),
            (_, 0..=255) => {
                self.emit_u8(short);
                self.emit_u8(index as u8);
            }
            _ => {
                self.emit_u8(op::PREFIX);
                self.emit_u8(long);
                self.emit_u16(index);
            }
        }
        self
    }

    pub fn ldarg(&mut self, index: u16) -> &mut Self {
        self.slot(index, Some(op::LDARG_0), op::LDARG_S, op::LDARG)
    }

    pub fn starg(&mut self, index: u16) -> &mut Self {
        self.slot(index, None, op::STARG_S, op::STARG)
    }

    pub fn ldloc(&mut self, index: u16) -> &mut Self {
        self.slot(index, Some(op::LDLOC_0), op::LDLOC_S, op::LDLOC)
    }

    pub fn stloc(&mut self, index: u16) -> &mut Self {
        self.slot(index, Some(op::STLOC_0), op::STLOC_S, op::STLOC)
    }

    pub fn call(&mut self, method: Token) -> &mut Self {
        self.with_token(op::CALL, method)
    }

    pub fn callvirt(&mut self, method: Token) -> &mut Self {
        self.with_token(op::CALLVIRT, method)
    }

    pub fn newobj(&mut self, ctor: Token) -> &mut Self {
        self.with_token(op::NEWOBJ, ctor)
    }

    pub fn ldfld(&mut self, field: Token) -> &mut Self {
        self.with_token(op::LDFLD, field)
    }

    pub fn stfld(&mut self, field: Token) -> &mut Self {
        self.with_token(op::STFLD, field)
    }

    pub fn ldstr(&mut self, string: Token) -> &mut Self {
        self.with_token(op::LDSTR, string)
    }

    /// Emit a branch to `label`. Short or long form follows from `opcode`.
    pub fn branch(&mut self, opcode: u8, label: Label) -> &mut Self {
        let wide = !matches!(opcode, op::BR_S..=op::BNE_UN_S | op::LEAVE_S);
        self.emit_u8(opcode);
        let at = self.buf.len();
        if wide {
            self.emit_i32(0);
        } else {
            self.emit_u8(0);
        }
        self.fixups.push(Fixup {
            at,
            base: self.buf.len(),
            label,
            wide,
        });
        self
    }

    /// Protect `[try_start, try_end)` with a catch handler.
    pub fn catch_region(
        &mut self,
        try_start: Label,
        try_end: Label,
        handler_start: Label,
        handler_end: Label,
        catch_type: Option<Token>,
    ) -> &mut Self {
        self.regions.push(PendingRegion {
            kind: RegionKind::Catch,
            try_start,
            try_end,
            handler_start,
            handler_end,
            catch_type,
        });
        self
    }

    pub fn finally_region(&mut self, try_start: Label, try_end: Label, handler_start: Label, handler_end: Label) -> &mut Self {
        self.regions.push(PendingRegion {
            kind: RegionKind::Finally,
            try_start,
            try_end,
            handler_start,
            handler_end,
            catch_type: None,
        });
        self
    }

    fn resolve(&self, label: Label) -> Result<usize, VmError> {
        self.labels
            .get(label.0)
            .copied()
            .flatten()
            .ok_or_else(|| VmError::Image(format!("label {} was never marked", label.0)))
    }

    /// Patch branch deltas and resolve region offsets.
    pub fn finish(mut self) -> Result<(Vec<u8>, Vec<ExceptionRegion>), VmError> {
        for fixup in &self.fixups {
            let target = self.resolve(fixup.label)?;
            let delta = target as i64 - fixup.base as i64;
            if fixup.wide {
                let bytes = (delta as i32).to_le_bytes();
                self.buf[fixup.at..fixup.at + 4].copy_from_slice(&bytes);
            } else {
                let short = i8::try_from(delta)
                    .map_err(|_| VmError::Image(format!("short branch delta {} out of range", delta)))?;
                self.buf[fixup.at] = short as u8;
            }
        }

        let mut regions = Vec::with_capacity(self.regions.len());
        for pending in &self.regions {
            let try_offset = self.resolve(pending.try_start)?;
            let handler_offset = self.resolve(pending.handler_start)?;
            regions.push(ExceptionRegion {
                kind: pending.kind,
                try_offset: try_offset as u32,
                try_length: self.resolve(pending.try_end)?.saturating_sub(try_offset) as u32,
                handler_offset: handler_offset as u32,
                handler_length: self.resolve(pending.handler_end)?.saturating_sub(handler_offset) as u32,
                catch_type: pending.catch_type,
            });
        }
        Ok((self.buf, regions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{decode, OpCode};
    use crate::metadata::MetadataProvider;

    #[test]
    fn test_ldc_forms() {
        let mut il = IlEmitter::new();
        il.ldc_i4(-1).ldc_i4(5).ldc_i4(100).ldc_i4(1000);
        let (code, _) = il.finish().unwrap();
        assert_eq!(code, vec![0x15, 0x1B, 0x1F, 100, 0x20, 0xE8, 0x03, 0x00, 0x00]);
    }

    #[test]
    fn test_slot_forms() {
        let mut il = IlEmitter::new();
        il.ldarg(1).ldarg(9).starg(0).stloc(2).ldloc(300);
        let (code, _) = il.finish().unwrap();
        assert_eq!(code, vec![0x03, 0x0E, 9, 0x10, 0, 0x0C, 0xFE, 0x0C, 0x2C, 0x01]);
    }

    #[test]
    fn test_forward_and_backward_branches() {
        let mut il = IlEmitter::new();
        let top = il.new_label();
        let done = il.new_label();
        il.mark(top).op(op::NOP).branch(op::BRTRUE, done).branch(op::BR_S, top).mark(done).op(op::RET);
        let (code, _) = il.finish().unwrap();
        let instrs = decode(&code).unwrap();
        assert_eq!(instrs[1].opcode, OpCode::Brtrue);
        assert_eq!(instrs[1].target(), Some(instrs[3].offset));
        assert_eq!(instrs[2].target(), Some(0));
    }

    #[test]
    fn test_unmarked_label_fails() {
        let mut il = IlEmitter::new();
        let nowhere = il.new_label();
        il.branch(op::BR, nowhere);
        assert!(matches!(il.finish(), Err(VmError::Image(_))));
    }

    #[test]
    fn test_regions_resolve_to_offsets() {
        let mut il = IlEmitter::new();
        let (try_start, try_end, handler, end) = (il.new_label(), il.new_label(), il.new_label(), il.new_label());
        il.mark(try_start).op(op::LDNULL).op(op::THROW).mark(try_end);
        il.mark(handler).op(op::POP).branch(op::LEAVE_S, end);
        il.mark(end).op(op::RET);
        il.catch_region(try_start, try_end, handler, end, None);
        let (_, regions) = il.finish().unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!((regions[0].try_offset, regions[0].try_length), (0, 2));
        assert_eq!((regions[0].handler_offset, regions[0].handler_length), (2, 3));
    }

    #[test]
    fn test_builder_tokens() {
        let mut b = ImageBuilder::new();
        let program = b.type_def("", "Program");
        let point = b.type_def("Geo", "Point");
        b.extends(point, "System.Object");
        let x = b.field(point, "x");
        let main = b.method(program, "Main", MethodSignature::new(0, false, false));
        let console = b.type_ref("System", "Console");
        let write = b.member_ref(console, "WriteLine", Some(MethodSignature::new(1, false, true)));
        let hello = b.user_string("hi");
        let mut il = IlEmitter::new();
        il.ldc_i4(0).op(op::RET);
        b.body(main, 0, il).unwrap().entry_point(main);
        let image = b.build();

        assert_eq!(program, Token(0x0200_0001));
        assert_eq!(x, Token(0x0400_0001));
        assert_eq!(main, Token(0x0600_0001));
        assert_eq!(console, Token(0x0100_0001));
        assert_eq!(write, Token(0x0A00_0001));
        assert_eq!(hello, Token(0x7000_0001));
        assert_eq!(image.type_name(point).unwrap(), "Geo.Point");
        assert_eq!(image.entry_point().unwrap(), main);
    }
}
