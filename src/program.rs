//! A program loaded for execution.

use std::path::Path;

use log::debug;

use crate::error::VmError;
use crate::il::{decode, Verifier};
use crate::metadata::{MetadataProvider, MethodSignature, ProgramImage, ResolutionCache, Token};
use crate::vm::DispatchCache;

/// Execution context for one program: its metadata provider, the resolution
/// cache built from it, and the dispatch cache filled while it runs.
///
/// Dropping the program releases all of them.
pub struct LoadedProgram {
    provider: Box<dyn MetadataProvider>,
    cache: ResolutionCache,
    dispatch: DispatchCache,
    entry_point: Token,
    entry_signature: MethodSignature,
}

impl LoadedProgram {
    /// Build the resolution cache and validate the entry point.
    pub fn load(provider: impl MetadataProvider + 'static) -> Result<Self, VmError> {
        let provider: Box<dyn MetadataProvider> = Box::new(provider);
        let cache = ResolutionCache::build(provider.as_ref())?;
        let entry_point = provider.entry_point()?;
        let entry_signature = cache.method_info(entry_point)?.signature;

        if entry_signature.is_instance {
            return Err(VmError::UnsupportedEntryPoint(format!(
                "entry point {} is an instance method",
                entry_point
            )));
        }
        if entry_signature.param_count > 1 {
            return Err(VmError::UnsupportedEntryPoint(format!(
                "entry point with {} parameters is not supported",
                entry_signature.param_count
            )));
        }

        debug!("loaded program, entry point {}", entry_point);
        Ok(Self {
            provider,
            cache,
            dispatch: DispatchCache::new(),
            entry_point,
            entry_signature,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, VmError> {
        Self::load(ProgramImage::load(path)?)
    }

    pub fn provider(&self) -> &dyn MetadataProvider {
        self.provider.as_ref()
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    pub fn dispatch(&self) -> &DispatchCache {
        &self.dispatch
    }

    pub(crate) fn dispatch_mut(&mut self) -> &mut DispatchCache {
        &mut self.dispatch
    }

    pub fn entry_point(&self) -> Token {
        self.entry_point
    }

    pub fn entry_signature(&self) -> MethodSignature {
        self.entry_signature
    }

    /// Decode and verify every method body. Returns how many were checked.
    pub fn check(&self) -> Result<usize, VmError> {
        let mut checked = 0;
        for ty in self.provider.types() {
            for method in self.provider.methods_of(ty)? {
                let signature = self.cache.method_info(method)?.signature;
                let body = self.provider.method_body(method)?;
                let instructions = decode(&body.code)?;
                Verifier::new(signature.arg_count(), body.local_count)
                    .verify(&instructions, &body.regions)?;
                checked += 1;
            }
        }
        Ok(checked)
    }
}
