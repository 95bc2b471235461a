//! Write-only channel into an external symbol registry.
//!
//! The analyzer tags virtual addresses with what it found there; it never
//! reads the registry back. Callers that don't care supply `NullSink`.
use crate::addr::Va;

/// What a published VA points at.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    /// the image base of a loaded module.
    InstanceBase,
    ExportDirectory,
    TlsDirectory,
    LoadConfigDirectory,
    /// a slot in the export address table.
    EatAddress,
    /// a slot in the export name-ordinal table.
    EatOrdinal,
    /// a slot in the export names table.
    EatName,
    /// an exported function body.
    Export,
    ImportDescriptor,
    /// an IAT slot, patched by the loader.
    ImportTable,
    /// an INT slot, holding the name/ordinal hint.
    ImportNameTable,
    DelayImportTable,
    DelayImportNameTable,
    BoundImportDescriptor,
    BoundImportForwardRef,
    /// the page header of a base-relocation block.
    RelocationBlock,
    TlsCallback,
    EntryPoint,
    StringData,
}

/// One published annotation.
///
/// `list_index` is the position in the owning image's entry list (exports,
/// imports, entry points, strings); `param` carries a kind-specific extra,
/// e.g. the bitness (32/64) for directory and thunk-table kinds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolRecord {
    pub va:           Va,
    pub kind:         SymbolKind,
    pub module_index: usize,
    pub list_index:   usize,
    pub param:        u64,
}

/// Append-only sink for symbol records.
pub trait SymbolSink {
    fn add(&mut self, record: SymbolRecord);
}

/// Sink that drops everything.
pub struct NullSink;

impl SymbolSink for NullSink {
    fn add(&mut self, _record: SymbolRecord) {}
}

/// Sink that collects records, for tests and small tools.
#[derive(Default)]
pub struct VecSink {
    pub records: Vec<SymbolRecord>,
}

impl SymbolSink for VecSink {
    fn add(&mut self, record: SymbolRecord) {
        self.records.push(record);
    }
}

impl VecSink {
    pub fn of_kind(&self, kind: SymbolKind) -> Vec<&SymbolRecord> {
        self.records.iter().filter(|r| r.kind == kind).collect()
    }
}
