use std::fmt;
use std::rc::Rc;

use super::ObjRef;
use crate::error::Fault;

/// A tagged value on the operand stack, in a local, argument, or field.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i32),
    Str(Rc<str>),
    Object(ObjRef),
    /// An engine-raised exception caught by a managed handler.
    Fault(Rc<Fault>),
    /// The `string[]` argument handed to an entry point.
    StrList(Rc<[Rc<str>]>),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjRef> {
        match self {
            Value::Object(r) => Some(*r),
            _ => None,
        }
    }

    /// Heap reference this value keeps alive, if any.
    pub fn gc_ref(&self) -> Option<ObjRef> {
        match self {
            Value::Object(r) => Some(*r),
            Value::Fault(fault) => fault.payload,
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null and zero are false, everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(n) => *n != 0,
            _ => true,
        }
    }

    /// Name of the value's kind for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int32",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
            Value::Fault(_) => "exception",
            Value::StrList(_) => "string[]",
        }
    }
}

/// Structural equality: integers by value, strings by content, references
/// by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Fault(a), Value::Fault(b)) => Rc::ptr_eq(a, b),
            (Value::StrList(a), Value::StrList(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Object(r) => write!(f, "{:?}", r),
            Value::Fault(fault) => write!(f, "{}", fault),
            Value::StrList(_) => write!(f, "System.String[]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(Value::str("").is_truthy());
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(Value::Null, Value::Null);
        assert_eq!(Value::Int(4), Value::Int(4));
        assert_eq!(Value::str("ab"), Value::Str(Rc::from(String::from("ab"))));
        assert_ne!(Value::Int(0), Value::Null);
        assert_ne!(Value::str("1"), Value::Int(1));
    }

    #[test]
    fn test_fault_equality_is_identity() {
        let fault = Rc::new(Fault::builtin("System.Exception", "x"));
        let a = Value::Fault(Rc::clone(&fault));
        assert_eq!(a, Value::Fault(fault));
        assert_ne!(a, Value::Fault(Rc::new(Fault::builtin("System.Exception", "x"))));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Null.to_string(), "");
        assert_eq!(Value::Int(-7).to_string(), "-7");
        assert_eq!(Value::str("hi").to_string(), "hi");
        assert_eq!(Value::StrList(Rc::from(Vec::new())).to_string(), "System.String[]");
    }
}
