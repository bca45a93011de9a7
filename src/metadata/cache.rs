use std::collections::{HashMap, HashSet};

use log::debug;

use super::{MetadataProvider, MethodSignature, Token, TokenKind};
use crate::error::{builtin_ancestry, VmError, OBJECT_TYPE};

/// Cached facts about one method definition.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodInfo {
    pub name: String,
    pub owner: Token,
    pub signature: MethodSignature,
}

/// Token lookups built once per loaded program.
///
/// Every method signature is read from the provider exactly once, here.
/// The cache is never mutated after [`ResolutionCache::build`]; tokens it
/// does not know (member references) are resolved through the provider on
/// each use.
#[derive(Debug, Default)]
pub struct ResolutionCache {
    methods: HashMap<Token, MethodInfo>,
    field_keys: HashMap<Token, String>,
    type_names: HashMap<Token, String>,
    type_fields: HashMap<Token, Vec<String>>,
    /// Ordered method list per qualified type name.
    type_methods: HashMap<String, Vec<Token>>,
    types_by_name: HashMap<String, Token>,
    base_types: HashMap<Token, String>,
}

impl ResolutionCache {
    pub fn build(provider: &dyn MetadataProvider) -> Result<Self, VmError> {
        let mut cache = ResolutionCache::default();

        for ty in provider.types() {
            let type_name = provider.type_name(ty)?;

            let mut methods = Vec::new();
            for method in provider.methods_of(ty)? {
                let info = MethodInfo {
                    name: provider.method_name(method)?,
                    owner: ty,
                    signature: provider.method_signature(method)?,
                };
                cache.methods.insert(method, info);
                methods.push(method);
            }

            let mut keys = Vec::new();
            for field in provider.fields_of(ty)? {
                let key = format!("{}::{}", type_name, provider.field_name(field)?);
                cache.field_keys.insert(field, key.clone());
                keys.push(key);
            }

            if let Some(base) = provider.base_type_name(ty)? {
                cache.base_types.insert(ty, base);
            }
            cache.type_fields.insert(ty, keys);
            cache.type_methods.insert(type_name.clone(), methods);
            cache.types_by_name.insert(type_name.clone(), ty);
            cache.type_names.insert(ty, type_name);
        }

        debug!(
            "resolution cache: {} types, {} methods, {} fields",
            cache.type_names.len(),
            cache.methods.len(),
            cache.field_keys.len()
        );
        Ok(cache)
    }

    pub fn method(&self, method: Token) -> Option<&MethodInfo> {
        self.methods.get(&method)
    }

    pub fn method_info(&self, method: Token) -> Result<&MethodInfo, VmError> {
        self.method(method)
            .ok_or_else(|| VmError::Metadata(format!("method {} is not defined in this program", method)))
    }

    pub fn owner_of(&self, method: Token) -> Option<Token> {
        self.methods.get(&method).map(|info| info.owner)
    }

    pub fn type_token(&self, type_name: &str) -> Option<Token> {
        self.types_by_name.get(type_name).copied()
    }

    /// Qualified type name; references fall back to the provider.
    pub fn type_name(&self, provider: &dyn MetadataProvider, ty: Token) -> Result<String, VmError> {
        match self.type_names.get(&ty) {
            Some(name) => Ok(name.clone()),
            None => provider.type_name(ty),
        }
    }

    /// `Type::field` key for a field definition or field reference.
    pub fn field_key(&self, provider: &dyn MetadataProvider, field: Token) -> Result<String, VmError> {
        if let Some(key) = self.field_keys.get(&field) {
            return Ok(key.clone());
        }
        match field.kind() {
            TokenKind::MemberRef => {
                let member = provider.member_ref(field)?;
                Ok(format!("{}::{}", self.type_name(provider, member.parent)?, member.name))
            }
            _ => Err(VmError::Metadata(format!("{} is not a field token", field))),
        }
    }

    /// Declared field keys of a type definition, in declaration order.
    pub fn field_keys_of(&self, ty: Token) -> &[String] {
        self.type_fields.get(&ty).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn methods_of_type(&self, type_name: &str) -> &[Token] {
        self.type_methods.get(type_name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First method of `type_name` with the given name and parameter count.
    pub fn find_method(&self, type_name: &str, name: &str, param_count: usize, instance_only: bool) -> Option<Token> {
        self.methods_of_type(type_name).iter().copied().find(|token| {
            self.methods.get(token).is_some_and(|info| {
                info.name == name
                    && info.signature.param_count == param_count
                    && (!instance_only || info.signature.is_instance)
            })
        })
    }

    /// Scan the runtime type's own method list for a virtual target.
    pub fn resolve_virtual(&self, runtime_type: Token, name: &str, param_count: usize) -> Option<Token> {
        let type_name = self.type_names.get(&runtime_type)?;
        self.find_method(type_name, name, param_count, true)
    }

    /// Resolve a `newobj` operand to `(constructor, owning type)`.
    pub fn resolve_constructor(&self, provider: &dyn MetadataProvider, token: Token) -> Result<(Token, Token), VmError> {
        match token.kind() {
            TokenKind::MethodDef => {
                let owner = self.owner_of(token).ok_or_else(|| {
                    VmError::Metadata(format!("could not resolve declaring type for constructor {}", token))
                })?;
                Ok((token, owner))
            }
            TokenKind::MemberRef => {
                let member = provider.member_ref(token)?;
                if member.name != ".ctor" {
                    return Err(VmError::UnsupportedCall(format!("newobj target {} is not a constructor", member.name)));
                }
                if member.parent.kind() != TokenKind::TypeDef {
                    return Err(VmError::UnsupportedCall(format!(
                        "constructor of {} is not defined in this program",
                        self.type_name(provider, member.parent)?
                    )));
                }
                let param_count = member.signature.map(|s| s.param_count).unwrap_or(0);
                let type_name = self.type_name(provider, member.parent)?;
                let ctor = self
                    .find_method(&type_name, ".ctor", param_count, false)
                    .ok_or_else(|| VmError::MissingMethod(format!("{}::.ctor({})", type_name, param_count)))?;
                Ok((ctor, member.parent))
            }
            _ => Err(VmError::UnsupportedCall(format!("unsupported newobj target {}", token))),
        }
    }

    /// Type names from `ty` up through its declared bases to `System.Object`.
    ///
    /// Bases outside the program continue with the engine's built-in
    /// exception hierarchy when they are part of it.
    pub fn ancestry(&self, ty: Token) -> Vec<String> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.type_names.get(&ty).cloned();
        let mut token = Some(ty);

        while let Some(name) = current.take() {
            if !seen.insert(name.clone()) {
                break;
            }
            let Some(t) = token else {
                chain.extend(builtin_ancestry(&name));
                return chain;
            };
            chain.push(name);
            current = self.base_types.get(&t).cloned();
            token = current.as_deref().and_then(|base| self.type_token(base));
        }

        if chain.last().map(String::as_str) != Some(OBJECT_TYPE) {
            chain.push(OBJECT_TYPE.to_string());
        }
        chain
    }
}
