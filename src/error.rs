// ⚠️ Error Taxonomy
// Only MissingInput (and Config) is fatal to a whole run. Everything else is
// caught at a record or file boundary and turned into data (ValidationError,
// Warning, ImportException).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    /// Malformed document - fatal to that file only
    #[error("structural parse error in {file} at line {line}, column {column}: {message}")]
    StructuralParse {
        file: String,
        line: usize,
        column: usize,
        message: String,
    },

    /// Field missing or type-mismatched - collected, non-fatal
    #[error("schema validation error on field '{field}': {message}")]
    SchemaValidation { field: String, message: String },

    /// Natural-key collision under FailOnConflict
    #[error("{kind} '{natural_key}' already exists (id {existing_id})")]
    Conflict {
        kind: String,
        natural_key: String,
        existing_id: i64,
    },

    /// Unexpected failure writing one record
    #[error("failed to persist {kind} '{natural_key}': {message}")]
    Persistence {
        kind: String,
        natural_key: String,
        message: String,
    },

    /// Absent input directory, document or schema definition
    #[error("missing input: {0}")]
    MissingInput(PathBuf),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl ImportError {
    /// Whether this error ends the whole run rather than one record/file
    pub fn is_fatal(&self) -> bool {
        matches!(self, ImportError::MissingInput(_) | ImportError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_missing_input_and_config_are_fatal() {
        assert!(ImportError::MissingInput(PathBuf::from("/nope")).is_fatal());
        assert!(ImportError::Config("bad".to_string()).is_fatal());

        let conflict = ImportError::Conflict {
            kind: "School".to_string(),
            natural_key: "S1".to_string(),
            existing_id: 4,
        };
        assert!(!conflict.is_fatal());
        assert_eq!(conflict.to_string(), "School 'S1' already exists (id 4)");
    }
}
