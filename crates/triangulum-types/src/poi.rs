//! Files and Points of Interest (POIs).

use serde::{Deserialize, Serialize};

use crate::{check_len, check_non_empty, RunId, TypesError, MAX_NAME_LEN, MAX_PATH_LEN};

/// Locally-unique (within a run) numeric identifier for a POI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoiId(pub i64);

/// Processing status of a discovered file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Discovered but not yet claimed by a worker.
    Pending,
    /// Currently being analyzed.
    Processing,
    /// Analysis finished and POIs were published.
    Analyzed,
    /// Analysis failed after exhausting retries.
    Failed,
}

/// A source file owned by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Owning run.
    pub run: RunId,
    /// Path, unique within the run.
    pub path: String,
    /// Content hash used for checkpoint validation and change detection.
    pub content_hash: String,
    /// Processing status.
    pub status: FileStatus,
}

/// The kind of code entity a POI represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoiKind {
    /// Free function.
    Function,
    /// Class or struct-like type.
    Class,
    /// Method on a class/type.
    Method,
    /// Variable binding.
    Variable,
    /// Import statement.
    Import,
    /// Export statement.
    Export,
    /// Interface/trait/protocol.
    Interface,
    /// Type alias or type definition.
    Type,
    /// Named constant.
    Constant,
    /// Module or file-level namespace.
    Module,
}

/// A code entity extracted from a file by LLM analysis.
///
/// `semantic_id` is a stable, human-readable identifier of the form
/// `<file-or-module>_<kind>_<name>`, used for cross-file references before
/// the numeric `id` is assigned by the Outbox Publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poi {
    /// Locally-unique id, assigned on insert.
    pub id: PoiId,
    /// Owning run.
    pub run: RunId,
    /// Path of the file the POI was extracted from.
    pub file_path: String,
    /// Entity kind.
    pub kind: PoiKind,
    /// Entity name.
    pub name: String,
    /// 1-based inclusive start line.
    pub start_line: u32,
    /// 1-based inclusive end line.
    pub end_line: u32,
    /// Whether the entity is exported from its module, if known.
    pub is_exported: Option<bool>,
    /// Stable cross-file reference id; unique per `(run, semantic_id)` when set.
    pub semantic_id: Option<String>,
    /// Opaque payload returned by the LLM for this entity.
    pub llm_payload: Option<serde_json::Value>,
}

impl Poi {
    /// Build the canonical semantic id `<file-or-module>_<kind>_<name>` used
    /// for cross-file references before the numeric id is known.
    pub fn derive_semantic_id(file_or_module: &str, kind: PoiKind, name: &str) -> String {
        format!("{}_{}_{}", file_or_module, kind.as_str(), name)
    }

    /// Validate name/path lengths before insertion.
    pub fn validate(&self) -> Result<(), TypesError> {
        check_non_empty("poi name", &self.name)?;
        check_len("poi name", &self.name, MAX_NAME_LEN)?;
        check_len("poi file path", &self.file_path, MAX_PATH_LEN)?;
        if self.end_line < self.start_line {
            return Err(TypesError::Empty("poi line range"));
        }
        Ok(())
    }
}

impl PoiKind {
    /// Lowercase token used in semantic ids and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            PoiKind::Function => "function",
            PoiKind::Class => "class",
            PoiKind::Method => "method",
            PoiKind::Variable => "variable",
            PoiKind::Import => "import",
            PoiKind::Export => "export",
            PoiKind::Interface => "interface",
            PoiKind::Type => "type",
            PoiKind::Constant => "constant",
            PoiKind::Module => "module",
        }
    }
}
