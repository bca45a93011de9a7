//! Serializable program image.
//!
//! A [`ProgramImage`] is a flat, table-shaped description of a program that
//! can be written by hand as TOML or JSON. Rows are numbered by position:
//! the first entry of `methods` is token `0x06000001`, the first entry of
//! `strings` is `0x70000001`, and so on. Method bodies are hex strings,
//! whitespace between bytes is ignored.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{
    qualified_name, table, ExceptionRegion, MemberRef, MetadataProvider, MethodSignature,
    RawMethodBody, Token, TokenKind,
};
use crate::error::VmError;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgramImage {
    #[serde(default)]
    pub name: String,
    pub entry_point: Token,
    #[serde(default)]
    pub types: Vec<TypeEntry>,
    #[serde(default)]
    pub type_refs: Vec<TypeRefEntry>,
    #[serde(default)]
    pub fields: Vec<FieldEntry>,
    #[serde(default)]
    pub methods: Vec<MethodEntry>,
    #[serde(default)]
    pub member_refs: Vec<MemberRefEntry>,
    #[serde(default)]
    pub strings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TypeEntry {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    /// Qualified name of the base type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TypeRefEntry {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub owner: Token,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodEntry {
    pub owner: Token,
    pub name: String,
    #[serde(default)]
    pub signature: MethodSignature,
    #[serde(default)]
    pub locals: usize,
    #[serde(with = "il_hex")]
    pub code: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<ExceptionRegion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRefEntry {
    pub parent: Token,
    pub name: String,
    /// Absent for field references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<MethodSignature>,
}

impl ProgramImage {
    /// Load an image from disk. `.json` files are read as JSON, everything
    /// else as TOML.
    pub fn load(path: &Path) -> Result<Self, VmError> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, VmError> {
        toml::from_str(text).map_err(|e| VmError::Image(e.to_string()))
    }

    pub fn from_json_str(text: &str) -> Result<Self, VmError> {
        serde_json::from_str(text).map_err(|e| VmError::Image(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, VmError> {
        toml::to_string(self).map_err(|e| VmError::Image(e.to_string()))
    }

    fn row<'a, T>(rows: &'a [T], token: Token, kind: TokenKind, what: &str) -> Result<&'a T, VmError> {
        if token.kind() != kind {
            return Err(VmError::Metadata(format!("token {} is not a {}", token, what)));
        }
        token
            .index()
            .and_then(|i| rows.get(i))
            .ok_or_else(|| VmError::Metadata(format!("{} token {} is out of range", what, token)))
    }

    fn method(&self, token: Token) -> Result<&MethodEntry, VmError> {
        Self::row(&self.methods, token, TokenKind::MethodDef, "method")
    }

    fn type_def(&self, token: Token) -> Result<&TypeEntry, VmError> {
        Self::row(&self.types, token, TokenKind::TypeDef, "type definition")
    }
}

fn tokens_where<T>(rows: &[T], table: u8, pred: impl Fn(&T) -> bool) -> Vec<Token> {
    rows.iter()
        .enumerate()
        .filter(|(_, row)| pred(row))
        .map(|(i, _)| Token::new(table, i as u32 + 1))
        .collect()
}

impl MetadataProvider for ProgramImage {
    fn entry_point(&self) -> Result<Token, VmError> {
        self.method(self.entry_point)
            .map_err(|_| VmError::UnsupportedEntryPoint(format!("{} is not a method definition", self.entry_point)))?;
        Ok(self.entry_point)
    }

    fn method_signature(&self, method: Token) -> Result<MethodSignature, VmError> {
        Ok(self.method(method)?.signature)
    }

    fn method_name(&self, method: Token) -> Result<String, VmError> {
        Ok(self.method(method)?.name.clone())
    }

    fn method_body(&self, method: Token) -> Result<RawMethodBody, VmError> {
        let entry = self.method(method)?;
        Ok(RawMethodBody {
            code: entry.code.clone(),
            local_count: entry.locals,
            regions: entry.regions.clone(),
        })
    }

    fn type_name(&self, ty: Token) -> Result<String, VmError> {
        match ty.kind() {
            TokenKind::TypeRef => {
                let entry = Self::row(&self.type_refs, ty, TokenKind::TypeRef, "type reference")?;
                Ok(qualified_name(&entry.namespace, &entry.name))
            }
            _ => {
                let entry = self.type_def(ty)?;
                Ok(qualified_name(&entry.namespace, &entry.name))
            }
        }
    }

    fn base_type_name(&self, ty: Token) -> Result<Option<String>, VmError> {
        match ty.kind() {
            TokenKind::TypeRef => Ok(None),
            _ => Ok(self.type_def(ty)?.extends.clone()),
        }
    }

    fn field_name(&self, field: Token) -> Result<String, VmError> {
        Ok(Self::row(&self.fields, field, TokenKind::Field, "field")?.name.clone())
    }

    fn user_string(&self, token: Token) -> Result<String, VmError> {
        Ok(Self::row(&self.strings, token, TokenKind::UserString, "user string")?.clone())
    }

    fn types(&self) -> Vec<Token> {
        (1..=self.types.len() as u32)
            .map(|row| Token::new(table::TYPE_DEF, row))
            .collect()
    }

    fn fields_of(&self, ty: Token) -> Result<Vec<Token>, VmError> {
        self.type_def(ty)?;
        Ok(tokens_where(&self.fields, table::FIELD, |f| f.owner == ty))
    }

    fn methods_of(&self, ty: Token) -> Result<Vec<Token>, VmError> {
        self.type_def(ty)?;
        Ok(tokens_where(&self.methods, table::METHOD_DEF, |m| m.owner == ty))
    }

    fn member_ref(&self, token: Token) -> Result<MemberRef, VmError> {
        let entry = Self::row(&self.member_refs, token, TokenKind::MemberRef, "member reference")?;
        Ok(MemberRef {
            parent: entry.parent,
            name: entry.name.clone(),
            signature: entry.signature,
        })
    }
}

/// Method bodies as space separated hex bytes.
mod il_hex {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(code: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let text = code
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
        if digits.len() % 2 != 0 {
            return Err(D::Error::custom("IL hex string has an odd number of digits"));
        }
        digits
            .chunks(2)
            .map(|pair| {
                std::str::from_utf8(pair)
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 16).ok())
                    .ok_or_else(|| D::Error::custom(format!("invalid IL hex byte '{}'", String::from_utf8_lossy(pair))))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RegionKind;

    const SAMPLE: &str = r#"
name = "sample"
entry_point = 0x06000001
strings = ["hello"]

[[types]]
name = "Program"

[[types]]
namespace = "Demo"
name = "Box"
extends = "System.Object"

[[type_refs]]
namespace = "System"
name = "Console"

[[fields]]
owner = 0x02000002
name = "value"

[[methods]]
owner = 0x02000001
name = "Main"
signature = { param_count = 0 }
locals = 1
code = "18 19 58 2A"

[[methods.regions]]
kind = "catch"
try_offset = 0
try_length = 3
handler_offset = 3

[[methods]]
owner = 0x02000002
name = ".ctor"
signature = { is_instance = true, returns_void = true }
code = "2a"

[[member_refs]]
parent = 0x01000001
name = "WriteLine"
signature = { param_count = 1, returns_void = true }
"#;

    #[test]
    fn test_parse_toml_image() {
        let image = ProgramImage::from_toml_str(SAMPLE).unwrap();
        assert_eq!(image.entry_point().unwrap(), Token(0x0600_0001));
        assert_eq!(image.types(), vec![Token(0x0200_0001), Token(0x0200_0002)]);
        assert_eq!(image.type_name(Token(0x0200_0002)).unwrap(), "Demo.Box");
        assert_eq!(image.type_name(Token(0x0100_0001)).unwrap(), "System.Console");
        assert_eq!(
            image.base_type_name(Token(0x0200_0002)).unwrap().as_deref(),
            Some("System.Object")
        );
        assert_eq!(image.fields_of(Token(0x0200_0002)).unwrap(), vec![Token(0x0400_0001)]);
        assert_eq!(image.methods_of(Token(0x0200_0002)).unwrap(), vec![Token(0x0600_0002)]);

        let body = image.method_body(Token(0x0600_0001)).unwrap();
        assert_eq!(body.code, vec![0x18, 0x19, 0x58, 0x2A]);
        assert_eq!(body.local_count, 1);
        assert_eq!(body.regions[0].kind, RegionKind::Catch);
        assert_eq!(body.regions[0].catch_type, None);

        let sig = image.method_signature(Token(0x0600_0002)).unwrap();
        assert!(sig.is_instance && sig.returns_void);
        assert_eq!(image.user_string(Token(0x7000_0001)).unwrap(), "hello");
        assert_eq!(image.member_ref(Token(0x0A00_0001)).unwrap().name, "WriteLine");
    }

    #[test]
    fn test_bad_hex_is_rejected() {
        let text = "entry_point = 0x06000001\n[[methods]]\nowner = 0x02000001\nname = \"Main\"\ncode = \"2\"\n";
        assert!(matches!(ProgramImage::from_toml_str(text), Err(VmError::Image(_))));
    }

    #[test]
    fn test_out_of_range_tokens() {
        let image = ProgramImage::from_toml_str(SAMPLE).unwrap();
        assert!(matches!(image.method_name(Token(0x0600_0009)), Err(VmError::Metadata(_))));
        assert!(matches!(image.field_name(Token(0x0600_0001)), Err(VmError::Metadata(_))));
    }

    #[test]
    fn test_toml_round_trip() {
        let image = ProgramImage::from_toml_str(SAMPLE).unwrap();
        let text = image.to_toml_string().unwrap();
        assert_eq!(ProgramImage::from_toml_str(&text).unwrap(), image);
    }

    #[test]
    fn test_json_image() {
        let text = r#"{
            "entry_point": 100663297,
            "types": [{ "name": "Program" }],
            "methods": [{ "owner": 33554433, "name": "Main", "code": "1B 2A" }]
        }"#;
        let image = ProgramImage::from_json_str(text).unwrap();
        assert_eq!(image.method_body(Token(0x0600_0001)).unwrap().code, vec![0x1B, 0x2A]);
    }
}
