//! Metadata model consumed by the engine.
//!
//! The engine never parses an executable container itself. Everything it
//! needs about types, methods, fields and strings comes through the
//! [`MetadataProvider`] trait; [`ProgramImage`] is the in-memory provider
//! used by the CLI and the tests.

mod builder;
mod cache;
mod image;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::VmError;

pub use builder::{IlEmitter, ImageBuilder, Label};
pub use cache::{MethodInfo, ResolutionCache};
pub use image::{FieldEntry, MemberRefEntry, MethodEntry, ProgramImage, TypeEntry, TypeRefEntry};

/// Metadata table identifiers stored in the top byte of a token.
pub mod table {
    pub const TYPE_REF: u8 = 0x01;
    pub const TYPE_DEF: u8 = 0x02;
    pub const FIELD: u8 = 0x04;
    pub const METHOD_DEF: u8 = 0x06;
    pub const MEMBER_REF: u8 = 0x0A;
    pub const USER_STRING: u8 = 0x70;
}

/// A metadata token: table in the high byte, 1-based row below it.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    TypeRef,
    TypeDef,
    Field,
    MethodDef,
    MemberRef,
    UserString,
    Other(u8),
}

impl Token {
    pub const fn new(table: u8, row: u32) -> Self {
        Token(((table as u32) << 24) | (row & 0x00FF_FFFF))
    }

    pub const fn table(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub const fn row(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    pub fn kind(self) -> TokenKind {
        match self.table() {
            table::TYPE_REF => TokenKind::TypeRef,
            table::TYPE_DEF => TokenKind::TypeDef,
            table::FIELD => TokenKind::Field,
            table::METHOD_DEF => TokenKind::MethodDef,
            table::MEMBER_REF => TokenKind::MemberRef,
            table::USER_STRING => TokenKind::UserString,
            other => TokenKind::Other(other),
        }
    }

    /// Zero-based index into the token's table, `None` for the nil row.
    pub fn index(self) -> Option<usize> {
        (self.row() as usize).checked_sub(1)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// The parts of a method signature the interpreter cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MethodSignature {
    #[serde(default)]
    pub param_count: usize,
    /// Whether the method takes an implicit receiver as argument 0.
    #[serde(default)]
    pub is_instance: bool,
    #[serde(default)]
    pub returns_void: bool,
}

impl MethodSignature {
    pub fn new(param_count: usize, is_instance: bool, returns_void: bool) -> Self {
        Self { param_count, is_instance, returns_void }
    }

    /// Total argument slots including the receiver.
    pub fn arg_count(&self) -> usize {
        self.param_count + usize::from(self.is_instance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    Catch,
    Finally,
}

/// A protected range of a method body and its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRegion {
    pub kind: RegionKind,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    #[serde(default)]
    pub handler_length: u32,
    /// `None` catches every fault.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch_type: Option<Token>,
}

impl ExceptionRegion {
    pub fn covers(&self, offset: u32) -> bool {
        offset >= self.try_offset && offset - self.try_offset < self.try_length
    }
}

/// Undecoded method body as handed out by a provider.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawMethodBody {
    pub code: Vec<u8>,
    pub local_count: usize,
    pub regions: Vec<ExceptionRegion>,
}

/// A reference to a member declared on another type.
///
/// Method references carry a signature; field references do not.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberRef {
    pub parent: Token,
    pub name: String,
    pub signature: Option<MethodSignature>,
}

/// Read-only access to a loaded program's metadata.
pub trait MetadataProvider {
    fn entry_point(&self) -> Result<Token, VmError>;
    fn method_signature(&self, method: Token) -> Result<MethodSignature, VmError>;
    fn method_name(&self, method: Token) -> Result<String, VmError>;
    fn method_body(&self, method: Token) -> Result<RawMethodBody, VmError>;
    /// Qualified name (`Namespace.Type`) of a type definition or reference.
    fn type_name(&self, ty: Token) -> Result<String, VmError>;
    /// Qualified name of the declared base type, if any.
    fn base_type_name(&self, ty: Token) -> Result<Option<String>, VmError>;
    fn field_name(&self, field: Token) -> Result<String, VmError>;
    fn user_string(&self, token: Token) -> Result<String, VmError>;
    fn types(&self) -> Vec<Token>;
    fn fields_of(&self, ty: Token) -> Result<Vec<Token>, VmError>;
    fn methods_of(&self, ty: Token) -> Result<Vec<Token>, VmError>;
    fn member_ref(&self, token: Token) -> Result<MemberRef, VmError>;
}

/// Join a namespace and a simple name the way metadata qualifies types.
pub fn qualified_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", namespace, name)
    }
}
