use super::opcode::op;
use super::{Instruction, OpCode, Operand};
use crate::error::VmError;
use crate::metadata::Token;

/// Decodes a raw method body into [`Instruction`]s in a single forward pass.
///
/// Relative branch deltas are resolved to absolute offsets measured from
/// the first byte after the branch instruction.
pub struct IlDecoder<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> IlDecoder<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self { code, pos: 0 }
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.code.len()
    }

    /// Decode the next instruction, or `None` at the end of the body.
    pub fn decode_next(&mut self) -> Result<Option<Instruction>, VmError> {
        if self.is_at_end() {
            return Ok(None);
        }
        let start = self.pos as u32;
        let byte = self.read_u8(start)?;
        let (opcode, operand) = match byte {
            op::NOP => (OpCode::Nop, None),
            op::LDARG_0..=op::LDARG_3 => (OpCode::Ldarg, Some(Operand::Index((byte - op::LDARG_0) as u16))),
            op::LDLOC_0..=op::LDLOC_3 => (OpCode::Ldloc, Some(Operand::Index((byte - op::LDLOC_0) as u16))),
            op::STLOC_0..=op::STLOC_3 => (OpCode::Stloc, Some(Operand::Index((byte - op::STLOC_0) as u16))),
            op::LDARG_S => (OpCode::Ldarg, Some(self.short_index(start)?)),
            op::STARG_S => (OpCode::Starg, Some(self.short_index(start)?)),
            op::LDLOC_S => (OpCode::Ldloc, Some(self.short_index(start)?)),
            op::STLOC_S => (OpCode::Stloc, Some(self.short_index(start)?)),
            op::LDNULL => (OpCode::Ldnull, None),
            op::LDC_I4_M1..=op::LDC_I4_8 => {
                (OpCode::LdcI4, Some(Operand::Int(byte as i32 - op::LDC_I4_0 as i32)))
            }
            op::LDC_I4_S => (OpCode::LdcI4, Some(Operand::Int(self.read_i8(start)? as i32))),
            op::LDC_I4 => (OpCode::LdcI4, Some(Operand::Int(self.read_i32(start)?))),
            op::DUP => (OpCode::Dup, None),
            op::POP => (OpCode::Pop, None),
            op::CALL => (OpCode::Call, Some(self.token(start)?)),
            op::RET => (OpCode::Ret, None),
            op::BR_S..=op::BNE_UN_S | op::LEAVE_S => {
                let delta = self.read_i8(start)? as i32;
                (short_branch(byte), Some(self.target(start, delta)?))
            }
            op::BR..=op::BNE_UN | op::LEAVE => {
                let delta = self.read_i32(start)?;
                (long_branch(byte), Some(self.target(start, delta)?))
            }
            op::ADD => (OpCode::Add, None),
            op::SUB => (OpCode::Sub, None),
            op::MUL => (OpCode::Mul, None),
            op::DIV => (OpCode::Div, None),
            op::REM => (OpCode::Rem, None),
            op::NEG => (OpCode::Neg, None),
            op::CALLVIRT => (OpCode::Callvirt, Some(self.token(start)?)),
            op::LDSTR => (OpCode::Ldstr, Some(self.token(start)?)),
            op::NEWOBJ => (OpCode::Newobj, Some(self.token(start)?)),
            op::THROW => (OpCode::Throw, None),
            op::LDFLD => (OpCode::Ldfld, Some(self.token(start)?)),
            op::STFLD => (OpCode::Stfld, Some(self.token(start)?)),
            op::ENDFINALLY => (OpCode::Endfinally, None),
            op::PREFIX => self.decode_extended(start)?,
            _ => {
                return Err(VmError::UnsupportedInstruction {
                    offset: start,
                    byte,
                    extended: false,
                });
            }
        };
        Ok(Some(Instruction::new(start, opcode, operand)))
    }

    fn decode_extended(&mut self, start: u32) -> Result<(OpCode, Option<Operand>), VmError> {
        let byte = self.read_u8(start)?;
        let decoded = match byte {
            op::CEQ => (OpCode::Ceq, None),
            op::CGT => (OpCode::Cgt, None),
            op::CLT => (OpCode::Clt, None),
            op::LDARG => (OpCode::Ldarg, Some(Operand::Index(self.read_u16(start)?))),
            op::STARG => (OpCode::Starg, Some(Operand::Index(self.read_u16(start)?))),
            op::LDLOC => (OpCode::Ldloc, Some(Operand::Index(self.read_u16(start)?))),
            op::STLOC => (OpCode::Stloc, Some(Operand::Index(self.read_u16(start)?))),
            _ => {
                return Err(VmError::UnsupportedInstruction {
                    offset: start,
                    byte,
                    extended: true,
                });
            }
        };
        Ok(decoded)
    }

    fn short_index(&mut self, start: u32) -> Result<Operand, VmError> {
        Ok(Operand::Index(self.read_u8(start)? as u16))
    }

    fn token(&mut self, start: u32) -> Result<Operand, VmError> {
        Ok(Operand::Token(Token(self.read_u32(start)?)))
    }

    fn target(&self, start: u32, delta: i32) -> Result<Operand, VmError> {
        let target = self.pos as i64 + delta as i64;
        u32::try_from(target)
            .map(Operand::Target)
            .map_err(|_| VmError::MalformedBody(format!("branch at IL_{:04X} targets offset {}", start, target)))
    }

    fn take<const N: usize>(&mut self, start: u32) -> Result<[u8; N], VmError> {
        let bytes = self
            .code
            .get(self.pos..self.pos + N)
            .and_then(|slice| <[u8; N]>::try_from(slice).ok())
            .ok_or_else(|| {
                VmError::MalformedBody(format!("instruction at IL_{:04X} is truncated", start))
            })?;
        self.pos += N;
        Ok(bytes)
    }

    fn read_u8(&mut self, start: u32) -> Result<u8, VmError> {
        Ok(self.take::<1>(start)?[0])
    }

    fn read_i8(&mut self, start: u32) -> Result<i8, VmError> {
        Ok(self.take::<1>(start)?[0] as i8)
    }

    fn read_u16(&mut self, start: u32) -> Result<u16, VmError> {
        Ok(u16::from_le_bytes(self.take(start)?))
    }

    fn read_i32(&mut self, start: u32) -> Result<i32, VmError> {
        Ok(i32::from_le_bytes(self.take(start)?))
    }

    fn read_u32(&mut self, start: u32) -> Result<u32, VmError> {
        Ok(u32::from_le_bytes(self.take(start)?))
    }
}

fn short_branch(byte: u8) -> OpCode {
    match byte {
        op::BR_S => OpCode::Br,
        op::BRFALSE_S => OpCode::Brfalse,
        op::BRTRUE_S => OpCode::Brtrue,
        op::BEQ_S => OpCode::Beq,
        op::BGE_S => OpCode::Bge,
        op::BGT_S => OpCode::Bgt,
        op::BLE_S => OpCode::Ble,
        op::BLT_S => OpCode::Blt,
        op::BNE_UN_S => OpCode::BneUn,
        _ => OpCode::Leave,
    }
}

fn long_branch(byte: u8) -> OpCode {
    match byte {
        op::BR => OpCode::Br,
        op::BRFALSE => OpCode::Brfalse,
        op::BRTRUE => OpCode::Brtrue,
        op::BEQ => OpCode::Beq,
        op::BGE => OpCode::Bge,
        op::BGT => OpCode::Bgt,
        op::BLE => OpCode::Ble,
        op::BLT => OpCode::Blt,
        op::BNE_UN => OpCode::BneUn,
        _ => OpCode::Leave,
    }
}

/// Decode a whole method body.
pub fn decode(code: &[u8]) -> Result<Vec<Instruction>, VmError> {
    let mut decoder = IlDecoder::new(code);
    let mut instructions = Vec::with_capacity(code.len() / 2);
    while let Some(instruction) = decoder.decode_next()? {
        instructions.push(instruction);
    }
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_add_program() {
        // ldc.i4.2; ldc.i4.3; add; ret
        let code = [0x18, 0x19, 0x58, 0x2A];
        let instrs = decode(&code).unwrap();
        assert_eq!(
            instrs,
            vec![
                Instruction::new(0, OpCode::LdcI4, Some(Operand::Int(2))),
                Instruction::new(1, OpCode::LdcI4, Some(Operand::Int(3))),
                Instruction::new(2, OpCode::Add, None),
                Instruction::new(3, OpCode::Ret, None),
            ]
        );
    }

    #[test]
    fn test_short_forms_normalize() {
        let code = [0x02, 0x05, 0x0E, 0x07, 0x06, 0x11, 0x09, 0x0D, 0x13, 0x04, 0x15, 0x1E];
        let instrs = decode(&code).unwrap();
        let ops: Vec<_> = instrs.iter().map(|i| (i.opcode, i.operand)).collect();
        assert_eq!(
            ops,
            vec![
                (OpCode::Ldarg, Some(Operand::Index(0))),
                (OpCode::Ldarg, Some(Operand::Index(3))),
                (OpCode::Ldarg, Some(Operand::Index(7))),
                (OpCode::Ldloc, Some(Operand::Index(0))),
                (OpCode::Ldloc, Some(Operand::Index(9))),
                (OpCode::Stloc, Some(Operand::Index(3))),
                (OpCode::Stloc, Some(Operand::Index(4))),
                (OpCode::LdcI4, Some(Operand::Int(-1))),
                (OpCode::LdcI4, Some(Operand::Int(8))),
            ]
        );
    }

    #[test]
    fn test_immediates() {
        // ldc.i4.s -5; ldc.i4 0x12345678
        let code = [0x1F, 0xFB, 0x20, 0x78, 0x56, 0x34, 0x12];
        let instrs = decode(&code).unwrap();
        assert_eq!(instrs[0].int(), Some(-5));
        assert_eq!(instrs[1].int(), Some(0x1234_5678));
        assert_eq!(instrs[1].offset, 2);
    }

    #[test]
    fn test_branch_targets_are_absolute() {
        // IL_0000: br.s +1 -> IL_0003
        // IL_0002: nop
        // IL_0003: brtrue -7 -> IL_0001 (next = 8)
        let code = [0x2B, 0x01, 0x00, 0x3A, 0xF9, 0xFF, 0xFF, 0xFF];
        let instrs = decode(&code).unwrap();
        assert_eq!(instrs[0].target(), Some(3));
        assert_eq!(instrs[2].opcode, OpCode::Brtrue);
        assert_eq!(instrs[2].target(), Some(1));
    }

    #[test]
    fn test_leave_and_compare_branches() {
        let code = [0xDE, 0x00, 0xDD, 0x00, 0x00, 0x00, 0x00, 0x2E, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00];
        let instrs = decode(&code).unwrap();
        let ops: Vec<_> = instrs.iter().map(|i| (i.opcode, i.target())).collect();
        assert_eq!(
            ops,
            vec![
                (OpCode::Leave, Some(2)),
                (OpCode::Leave, Some(7)),
                (OpCode::Beq, Some(9)),
                (OpCode::BneUn, Some(14)),
            ]
        );
    }

    #[test]
    fn test_extended_opcodes() {
        let code = [0xFE, 0x01, 0xFE, 0x02, 0xFE, 0x04, 0xFE, 0x0C, 0x2C, 0x01, 0xFE, 0x0B, 0x01, 0x00];
        let instrs = decode(&code).unwrap();
        let ops: Vec<_> = instrs.iter().map(|i| (i.offset, i.opcode, i.operand)).collect();
        assert_eq!(
            ops,
            vec![
                (0, OpCode::Ceq, None),
                (2, OpCode::Cgt, None),
                (4, OpCode::Clt, None),
                (6, OpCode::Ldloc, Some(Operand::Index(0x012C))),
                (10, OpCode::Starg, Some(Operand::Index(1))),
            ]
        );
    }

    #[test]
    fn test_token_operands() {
        let code = [0x28, 0x02, 0x00, 0x00, 0x06, 0x72, 0x01, 0x00, 0x00, 0x70];
        let instrs = decode(&code).unwrap();
        assert_eq!(instrs[0].token(), Some(Token(0x0600_0002)));
        assert_eq!(instrs[1].opcode, OpCode::Ldstr);
        assert_eq!(instrs[1].token(), Some(Token(0x7000_0001)));
    }

    #[test]
    fn test_unsupported_instruction() {
        let err = decode(&[0x00, 0x8D]).unwrap_err();
        assert!(matches!(
            err,
            VmError::UnsupportedInstruction { offset: 1, byte: 0x8D, extended: false }
        ));

        let err = decode(&[0xFE, 0x11]).unwrap_err();
        assert!(matches!(
            err,
            VmError::UnsupportedInstruction { offset: 0, byte: 0x11, extended: true }
        ));
    }

    #[test]
    fn test_truncated_operand() {
        assert!(matches!(decode(&[0x20, 0x01, 0x02]), Err(VmError::MalformedBody(_))));
        assert!(matches!(decode(&[0xFE]), Err(VmError::MalformedBody(_))));
    }

    #[test]
    fn test_negative_target_is_malformed() {
        assert!(matches!(decode(&[0x2B, 0x80]), Err(VmError::MalformedBody(_))));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let code = [0x16, 0x0A, 0x06, 0x17, 0x58, 0x0A, 0x06, 0x1A, 0x32, 0xF8, 0x06, 0x2A];
        let first = decode(&code).unwrap();
        let second = decode(&code).unwrap();
        assert_eq!(first, second);
        let offsets: Vec<u32> = first.iter().map(|i| i.offset).collect();
        for instr in &first {
            if let Some(target) = instr.target() {
                assert!(offsets.contains(&target));
            }
        }
    }

    #[test]
    fn test_empty_body() {
        assert!(decode(&[]).unwrap().is_empty());
    }
}
