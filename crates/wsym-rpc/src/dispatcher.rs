//! The six RPC method bodies (spec.md §4.6), sitting between the wire
//! types in [`crate::proto`] and [`wsym_module::ModuleCache`].
//!
//! `ModuleCache` allocates its own internal [`ModuleId`]; the `AddRawModule`
//! RPC instead names modules by a caller-chosen `rawModuleId` string
//! (spec.md §4.5). Rather than teaching the cache a foreign id scheme, this
//! layer keeps its own `rawModuleId → ModuleId` map and performs the
//! "evict, then (re)load" fusion spec.md §4.5 describes on top of it.

use std::collections::HashMap;

use wsym_module::{ModuleCache, ModuleId, Result as ModuleResult, SourceLocation, SymbolServerError};

use crate::proto::*;

/// Default formatter scratch pad size, in 64KiB Wasm pages, when the CLI
/// doesn't override it (SPEC_FULL.md §3's `scratch_pad_pages` knob). One
/// page comfortably holds any scalar/array/aggregate JSON record this
/// server's test corpus produces.
pub const DEFAULT_SCRATCH_PAD_PAGES: u32 = 1;

pub struct Dispatcher {
    cache: ModuleCache,
    ids: HashMap<String, ModuleId>,
    scratch_pad_pages: u32,
}

impl Dispatcher {
    pub fn new(cache: ModuleCache, scratch_pad_pages: u32) -> Self {
        Dispatcher { cache, ids: HashMap::new(), scratch_pad_pages }
    }

    fn resolve(&self, raw_module_id: &str) -> ModuleResult<ModuleId> {
        self.ids
            .get(raw_module_id)
            .copied()
            .ok_or_else(|| SymbolServerError::NotFound(format!("module with id '{raw_module_id}' not found")))
    }

    pub fn add_raw_module(&mut self, req: AddRawModuleRequest) -> ModuleResult<AddRawModuleResponse> {
        if let Some(old_id) = self.ids.remove(&req.raw_module_id) {
            tracing::warn!(raw_module_id = %req.raw_module_id, "deleted duplicate module");
            self.cache.delete(old_id);
        }

        let id = if let Some(code) = req.raw_module.code {
            self.cache.add_from_bytes(code)?
        } else if let Some(url) = req.raw_module.url {
            self.cache.add_from_url(&url)?
        } else {
            return Err(SymbolServerError::Protocol("rawModule needs a url or code".into()));
        };

        self.ids.insert(req.raw_module_id.clone(), id);
        let entry = self.cache.find(id).expect("id was just inserted");
        let sources: Vec<String> = entry.module.source_scripts().into_iter().map(|s| s.filename).collect();
        tracing::info!(raw_module_id = %req.raw_module_id, sources = sources.len(), "module registered");
        Ok(AddRawModuleResponse { sources })
    }

    pub fn source_location_to_raw_location(
        &self,
        loc: WireSourceLocation,
    ) -> ModuleResult<SourceLocationToRawLocationResponse> {
        let id = self.resolve(&loc.raw_module_id)?;
        let entry = self.cache.find(id).expect("resolve only returns registered ids");

        // 0-based wire -> 1-based DWARF, exactly once at ingress (spec.md §6).
        let source = SourceLocation {
            file: loc.source_file,
            line: loc.line_number + 1,
            column: loc.column_number + 1,
        };

        let raw_location = entry
            .module
            .offset_from_source_location(&source)
            .into_iter()
            .map(|offset| WireRawLocation { raw_module_id: loc.raw_module_id.clone(), code_offset: offset })
            .collect();
        Ok(SourceLocationToRawLocationResponse { raw_location })
    }

    pub fn raw_location_to_source_location(
        &self,
        loc: WireRawLocation,
    ) -> ModuleResult<RawLocationToSourceLocationResponse> {
        let id = self.resolve(&loc.raw_module_id)?;
        let entry = self.cache.find(id).expect("resolve only returns registered ids");

        // 1-based DWARF -> 0-based wire, exactly once at egress (spec.md §6).
        let source_location = entry
            .module
            .source_location_from_offset(loc.code_offset)
            .into_iter()
            .map(|s| WireSourceLocation {
                raw_module_id: loc.raw_module_id.clone(),
                source_file: s.file,
                line_number: s.line.saturating_sub(1),
                column_number: s.column.saturating_sub(1),
            })
            .collect();
        Ok(RawLocationToSourceLocationResponse { source_location })
    }

    pub fn list_variables_in_scope(&self, loc: WireRawLocation) -> ModuleResult<ListVariablesInScopeResponse> {
        let id = self.resolve(&loc.raw_module_id)?;
        let entry = self.cache.find(id).expect("resolve only returns registered ids");

        let variable = entry
            .module
            .variables_in_scope(loc.code_offset)
            .into_iter()
            .map(|v| WireVariable { scope: v.scope.into(), name: v.name, type_: v.type_name })
            .collect();
        Ok(ListVariablesInScopeResponse { variable })
    }

    pub fn evaluate_variable(&self, req: EvaluateVariableRequest) -> ModuleResult<EvaluateVariableResponse> {
        let id = self.resolve(&req.location.raw_module_id)?;
        let entry = self.cache.find(id).expect("resolve only returns registered ids");

        let variable = entry
            .module
            .variable_format_script(req.location.code_offset, &req.name)
            .ok_or_else(|| SymbolServerError::NotFound(format!("variable '{}' not found", req.name)))?;

        let ir = wsym_format::generate_module(&variable, self.scratch_pad_pages).map_err(|err| {
            tracing::warn!(name = %req.name, %err, "formatter generation failed");
            SymbolServerError::internal(err)
        })?;
        let code = wsym_format::generate_code(ir).map_err(SymbolServerError::internal)?;
        tracing::debug!(name = %req.name, bytes = code.len(), "formatter generated");
        Ok(EvaluateVariableResponse { value: RawModuleValue { url: None, code } })
    }
}
