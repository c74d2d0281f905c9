// ⚙️ Configuration
// Defaults live here; a TOML file can override any subset of them and CLI
// flags override the file.

use crate::error::ImportError;
use crate::parser::SourceKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File names for one source kind inside the input directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFiles {
    pub document: String,
    pub schema: String,
}

impl SourceFiles {
    fn new(stem: &str) -> Self {
        SourceFiles {
            document: format!("{}.xml", stem),
            schema: format!("{}.xsd", stem),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Maximum stored length for any text field (characters)
    pub max_string_length: usize,

    /// SQLite database used by the `run`, `history` and `show` commands
    pub database_path: PathBuf,

    /// Identity recorded on runs and audit events
    pub actor: String,

    /// Directory for exceptions reports (None = next to the input)
    pub report_dir: Option<PathBuf>,

    pub schools: SourceFiles,
    pub class_groups: SourceFiles,
    pub activities: SourceFiles,
    pub students: SourceFiles,
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            max_string_length: 255,
            database_path: PathBuf::from("legacy_import.db"),
            actor: "legacy-import".to_string(),
            report_dir: None,
            schools: SourceFiles::new("schools"),
            class_groups: SourceFiles::new("class_groups"),
            activities: SourceFiles::new("activities"),
            students: SourceFiles::new("students"),
        }
    }
}

impl ImportConfig {
    /// Load a TOML config file; missing keys fall back to defaults
    pub fn load(path: &Path) -> Result<Self, ImportError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ImportError::Config(format!("{}: {}", path.display(), e)))?;
        let config: ImportConfig = toml::from_str(&content)
            .map_err(|e| ImportError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ImportError> {
        if self.max_string_length == 0 {
            return Err(ImportError::Config(
                "max_string_length must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn files_for(&self, kind: SourceKind) -> &SourceFiles {
        match kind {
            SourceKind::School => &self.schools,
            SourceKind::ClassGroup => &self.class_groups,
            SourceKind::Activity => &self.activities,
            SourceKind::Student => &self.students,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ImportConfig::default();
        assert_eq!(config.max_string_length, 255);
        assert_eq!(config.files_for(SourceKind::Student).document, "students.xml");
        assert_eq!(config.files_for(SourceKind::ClassGroup).schema, "class_groups.xsd");
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "max_string_length = 80\nactor = \"migration-team\"\n\n[schools]\ndocument = \"Ecoles.xml\"\nschema = \"Ecoles.xsd\""
        )
        .unwrap();

        let config = ImportConfig::load(file.path()).unwrap();
        assert_eq!(config.max_string_length, 80);
        assert_eq!(config.actor, "migration-team");
        assert_eq!(config.schools.document, "Ecoles.xml");
        // Untouched sections keep defaults
        assert_eq!(config.activities.document, "activities.xml");
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_string_length = 0").unwrap();

        let err = ImportConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ImportError::Config(_)));
    }
}
