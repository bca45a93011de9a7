//! Library calls the engine implements natively instead of running IL.

/// The closed set of recognized library methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    /// `System.Console::WriteLine`: no arguments prints an empty line, several
    /// arguments are joined with a single space.
    WriteLine,
    /// `System.String::Concat`: any number of arguments, null as empty text.
    Concat,
}

impl Intrinsic {
    pub fn lookup(type_name: &str, method: &str) -> Option<Self> {
        match (type_name, method) {
            ("System.Console", "WriteLine") => Some(Intrinsic::WriteLine),
            ("System.String", "Concat") => Some(Intrinsic::Concat),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Intrinsic::WriteLine => "System.Console::WriteLine",
            Intrinsic::Concat => "System.String::Concat",
        }
    }
}
