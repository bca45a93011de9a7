/// Raw opcode bytes of the supported instruction subset.
pub mod op {
    pub const NOP: u8 = 0x00;
    pub const LDARG_0: u8 = 0x02;
    pub const LDARG_3: u8 = 0x05;
    pub const LDLOC_0: u8 = 0x06;
    pub const LDLOC_3: u8 = 0x09;
    pub const STLOC_0: u8 = 0x0A;
    pub const STLOC_3: u8 = 0x0D;
    pub const LDARG_S: u8 = 0x0E;
    pub const STARG_S: u8 = 0x10;
    pub const LDLOC_S: u8 = 0x11;
    pub const STLOC_S: u8 = 0x13;
    pub const LDNULL: u8 = 0x14;
    pub const LDC_I4_M1: u8 = 0x15;
    pub const LDC_I4_0: u8 = 0x16;
    pub const LDC_I4_8: u8 = 0x1E;
    pub const LDC_I4_S: u8 = 0x1F;
    pub const LDC_I4: u8 = 0x20;
    pub const DUP: u8 = 0x25;
    pub const POP: u8 = 0x26;
    pub const CALL: u8 = 0x28;
    pub const RET: u8 = 0x2A;
    pub const BR_S: u8 = 0x2B;
    pub const BRFALSE_S: u8 = 0x2C;
    pub const BRTRUE_S: u8 = 0x2D;
    pub const BEQ_S: u8 = 0x2E;
    pub const BGE_S: u8 = 0x2F;
    pub const BGT_S: u8 = 0x30;
    pub const BLE_S: u8 = 0x31;
    pub const BLT_S: u8 = 0x32;
    pub const BNE_UN_S: u8 = 0x33;
    pub const BR: u8 = 0x38;
    pub const BRFALSE: u8 = 0x39;
    pub const BRTRUE: u8 = 0x3A;
    pub const BEQ: u8 = 0x3B;
    pub const BGE: u8 = 0x3C;
    pub const BGT: u8 = 0x3D;
    pub const BLE: u8 = 0x3E;
    pub const BLT: u8 = 0x3F;
    pub const BNE_UN: u8 = 0x40;
    pub const ADD: u8 = 0x58;
    pub const SUB: u8 = 0x59;
    pub const MUL: u8 = 0x5A;
    pub const DIV: u8 = 0x5B;
    pub const REM: u8 = 0x5D;
    pub const NEG: u8 = 0x65;
    pub const CALLVIRT: u8 = 0x6F;
    pub const LDSTR: u8 = 0x72;
    pub const NEWOBJ: u8 = 0x73;
    pub const THROW: u8 = 0x7A;
    pub const LDFLD: u8 = 0x7B;
    pub const STFLD: u8 = 0x7D;
    pub const ENDFINALLY: u8 = 0xDC;
    pub const LEAVE: u8 = 0xDD;
    pub const LEAVE_S: u8 = 0xDE;

    /// Lead byte of the two-byte opcodes below.
    pub const PREFIX: u8 = 0xFE;
    pub const CEQ: u8 = 0x01;
    pub const CGT: u8 = 0x02;
    pub const CLT: u8 = 0x04;
    pub const LDARG: u8 = 0x09;
    pub const STARG: u8 = 0x0B;
    pub const LDLOC: u8 = 0x0C;
    pub const STLOC: u8 = 0x0E;
}

/// Decoded opcode. Short and macro forms collapse onto one variant with an
/// explicit operand, so `ldarg.1`, `ldarg.s 1` and `ldarg 1` all decode to
/// [`OpCode::Ldarg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Nop,
    Ldarg,
    Starg,
    Ldloc,
    Stloc,
    Ldnull,
    LdcI4,
    Dup,
    Pop,
    Call,
    Ret,
    Br,
    Brfalse,
    Brtrue,
    Beq,
    Bge,
    Bgt,
    Ble,
    Blt,
    BneUn,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Callvirt,
    Ldstr,
    Newobj,
    Throw,
    Ldfld,
    Stfld,
    Endfinally,
    Leave,
    Ceq,
    Cgt,
    Clt,
}

impl OpCode {
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::Nop => "nop",
            OpCode::Ldarg => "ldarg",
            OpCode::Starg => "starg",
            OpCode::Ldloc => "ldloc",
            OpCode::Stloc => "stloc",
            OpCode::Ldnull => "ldnull",
            OpCode::LdcI4 => "ldc.i4",
            OpCode::Dup => "dup",
            OpCode::Pop => "pop",
            OpCode::Call => "call",
            OpCode::Ret => "ret",
            OpCode::Br => "br",
            OpCode::Brfalse => "brfalse",
            OpCode::Brtrue => "brtrue",
            OpCode::Beq => "beq",
            OpCode::Bge => "bge",
            OpCode::Bgt => "bgt",
            OpCode::Ble => "ble",
            OpCode::Blt => "blt",
            OpCode::BneUn => "bne.un",
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul => "mul",
            OpCode::Div => "div",
            OpCode::Rem => "rem",
            OpCode::Neg => "neg",
            OpCode::Callvirt => "callvirt",
            OpCode::Ldstr => "ldstr",
            OpCode::Newobj => "newobj",
            OpCode::Throw => "throw",
            OpCode::Ldfld => "ldfld",
            OpCode::Stfld => "stfld",
            OpCode::Endfinally => "endfinally",
            OpCode::Leave => "leave",
            OpCode::Ceq => "ceq",
            OpCode::Cgt => "cgt",
            OpCode::Clt => "clt",
        }
    }
}
