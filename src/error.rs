//! Error taxonomy of the execution engine.
//!
//! Every failure is a [`VmError`]. A subset of them are *catchable*: they can
//! be turned into a managed [`Fault`] and matched against the exception
//! regions of the running frames. Everything else is fatal and goes straight
//! back to the host.

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::vm::ObjRef;

/// The universal base type every fault ancestry ends in.
pub const OBJECT_TYPE: &str = "System.Object";

/// Reason an operand could not be used by an arithmetic instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandFault {
    DivideByZero,
    Overflow,
    InvalidCast,
}

impl OperandFault {
    pub fn type_name(self) -> &'static str {
        match self {
            OperandFault::DivideByZero => "System.DivideByZeroException",
            OperandFault::Overflow => "System.OverflowException",
            OperandFault::InvalidCast => "System.InvalidCastException",
        }
    }
}

/// A raised managed exception.
///
/// `ancestry` starts with the fault's own type name and walks the base
/// types up to [`OBJECT_TYPE`].
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub type_name: String,
    pub ancestry: Vec<String>,
    pub message: String,
    /// The managed object passed to `throw`, if the fault came from one.
    pub payload: Option<ObjRef>,
}

impl Fault {
    /// Build a fault for one of the well-known runtime exception types.
    pub fn builtin(type_name: &str, message: impl Into<String>) -> Self {
        Fault {
            type_name: type_name.to_string(),
            ancestry: builtin_ancestry(type_name),
            message: message.into(),
            payload: None,
        }
    }

    /// Build a fault for a thrown managed object of the given runtime type.
    pub fn for_object(ancestry: Vec<String>, payload: ObjRef) -> Self {
        let type_name = ancestry
            .first()
            .cloned()
            .unwrap_or_else(|| OBJECT_TYPE.to_string());
        Fault {
            message: format!("Exception of type '{}' was thrown.", type_name),
            type_name,
            ancestry,
            payload: Some(payload),
        }
    }

    /// Whether a handler declared for `catch_type` accepts this fault.
    pub fn is_instance_of(&self, catch_type: &str) -> bool {
        catch_type == OBJECT_TYPE || self.ancestry.iter().any(|name| name == catch_type)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// Base chain of the runtime exception types the engine raises itself.
///
/// Unknown names get a chain of just themselves plus `System.Object`.
pub fn builtin_ancestry(type_name: &str) -> Vec<String> {
    let mut chain = vec![type_name.to_string()];
    let mut current = type_name;
    while let Some(base) = builtin_base(current) {
        chain.push(base.to_string());
        current = base;
    }
    if current != OBJECT_TYPE {
        chain.push(OBJECT_TYPE.to_string());
    }
    chain
}

fn builtin_base(type_name: &str) -> Option<&'static str> {
    match type_name {
        "System.DivideByZeroException" | "System.OverflowException" => {
            Some("System.ArithmeticException")
        }
        "System.MissingFieldException" | "System.MissingMethodException" => {
            Some("System.MissingMemberException")
        }
        "System.MissingMemberException" => Some("System.MemberAccessException"),
        "System.ArithmeticException"
        | "System.InvalidCastException"
        | "System.NullReferenceException"
        | "System.MemberAccessException"
        | "System.InvalidOperationException" => Some("System.SystemException"),
        "System.SystemException" | "System.ApplicationException" => Some("System.Exception"),
        "System.Exception" => Some(OBJECT_TYPE),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("unsupported instruction {} at IL_{offset:04X}", opcode_text(.byte, .extended))]
    UnsupportedInstruction { offset: u32, byte: u8, extended: bool },

    #[error("malformed method body: {0}")]
    MalformedBody(String),

    #[error("invalid branch target IL_{target:04X} from IL_{offset:04X}")]
    InvalidBranchTarget { offset: u32, target: u32 },

    #[error("invalid operand: {detail}")]
    InvalidOperand { fault: OperandFault, detail: String },

    #[error("null reference: {0}")]
    NullReference(String),

    #[error("missing field: {0}")]
    MissingField(String),

    #[error("missing method: {0}")]
    MissingMethod(String),

    #[error("method {method} expects {expected} arguments, received {actual}")]
    ArityMismatch {
        method: String,
        expected: usize,
        actual: usize,
    },

    #[error("unsupported entry point: {0}")]
    UnsupportedEntryPoint(String),

    #[error("unsupported call target: {0}")]
    UnsupportedCall(String),

    #[error("call depth limit of {0} exceeded")]
    StackOverflow(usize),

    #[error("dangling object reference {0:?}")]
    DanglingReference(ObjRef),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("unhandled exception: {0}")]
    Thrown(Rc<Fault>),

    #[error("program image error: {0}")]
    Image(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn opcode_text(byte: &u8, extended: &bool) -> String {
    if *extended {
        format!("0xFE 0x{:02X}", byte)
    } else {
        format!("0x{:02X}", byte)
    }
}

impl VmError {
    /// Managed view of this error, or `None` when it is fatal.
    pub fn to_fault(&self) -> Option<Rc<Fault>> {
        let fault = match self {
            VmError::Thrown(fault) => return Some(Rc::clone(fault)),
            VmError::NullReference(msg) => Fault::builtin("System.NullReferenceException", msg.clone()),
            VmError::InvalidOperand { fault, detail } => Fault::builtin(fault.type_name(), detail.clone()),
            VmError::MissingField(msg) => Fault::builtin("System.MissingFieldException", msg.clone()),
            VmError::MissingMethod(msg) => Fault::builtin("System.MissingMethodException", msg.clone()),
            _ => return None,
        };
        Some(Rc::new(fault))
    }

    pub fn is_catchable(&self) -> bool {
        matches!(
            self,
            VmError::Thrown(_)
                | VmError::NullReference(_)
                | VmError::InvalidOperand { .. }
                | VmError::MissingField(_)
                | VmError::MissingMethod(_)
        )
    }
}
