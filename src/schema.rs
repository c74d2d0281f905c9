// 📐 Shape Layer - Schema Definitions
// Loads the XSD that accompanies each legacy export and validates raw
// records against it. Violations are collected, never thrown.

use crate::error::ImportError;
use crate::mapper::truncate_chars;
use crate::parser::{decode_field_name, LineIndex, RawRecord};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// FIELD TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Text,
    Integer,
    Decimal,
    Date,
    Boolean,
}

impl FieldType {
    /// Map an XSD type name (`xsd:int`, `decimal`, ...) to a FieldType
    pub fn from_xsd(type_name: &str) -> FieldType {
        let local = type_name.rsplit(':').next().unwrap_or(type_name);
        match local {
            "int" | "integer" | "short" | "long" | "byte" | "unsignedByte" | "unsignedShort"
            | "unsignedInt" | "nonNegativeInteger" | "positiveInteger" => FieldType::Integer,
            "decimal" | "double" | "float" => FieldType::Decimal,
            "date" | "dateTime" => FieldType::Date,
            "boolean" => FieldType::Boolean,
            _ => FieldType::Text,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Decimal)
    }

    /// Strict conformance check for the canonical XSD lexical forms
    fn accepts(&self, value: &str) -> bool {
        match self {
            FieldType::Text => true,
            FieldType::Integer => value.parse::<i64>().is_ok(),
            FieldType::Decimal => value.parse::<f64>().is_ok(),
            FieldType::Date => {
                chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
                    || chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").is_ok()
            }
            FieldType::Boolean => matches!(value, "true" | "false" | "1" | "0"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Decimal => "decimal",
            FieldType::Date => "date",
            FieldType::Boolean => "boolean",
        }
    }
}

// ============================================================================
// SCHEMA DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Element name as written in the export (`Code_x0020_School`)
    pub xml_name: String,

    /// Decoded logical name (`Code School`)
    pub name: String,

    pub field_type: FieldType,
    pub required: bool,
    pub max_length: Option<usize>,
}

impl FieldDefinition {
    pub fn new(xml_name: impl Into<String>, field_type: FieldType) -> Self {
        let xml_name = xml_name.into();
        FieldDefinition {
            name: decode_field_name(&xml_name),
            xml_name,
            field_type,
            required: false,
            max_length: None,
        }
    }

    /// Builder: mark as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Document root element, when the XSD declares one
    pub root: Option<String>,

    /// Element wrapping one record
    pub record_element: String,

    pub fields: Vec<FieldDefinition>,
}

#[derive(Debug, Default)]
struct TopLevelElement {
    name: String,
    refs: Vec<String>,
    fields: Vec<FieldDefinition>,
}

impl SchemaDefinition {
    pub fn load(path: &Path) -> Result<SchemaDefinition, ImportError> {
        if !path.is_file() {
            return Err(ImportError::MissingInput(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("schema.xsd");
        SchemaDefinition::parse(&content, file_name)
    }

    /// Parse XSD text. Only the subset legacy exporters emit is understood:
    /// top-level elements, `ref`s from the root, named child elements with
    /// `type` or `restriction base`, `minOccurs` and `maxLength`.
    pub fn parse(xsd: &str, file_name: &str) -> Result<SchemaDefinition, ImportError> {
        let mut reader = Reader::from_str(xsd);
        reader.config_mut().trim_text(true);

        let mut top_level: Vec<TopLevelElement> = Vec::new();
        // One entry per open <element>; true when it is a field definition
        let mut open_elements: Vec<bool> = Vec::new();
        let mut pending_field: Option<usize> = None;

        loop {
            let event = reader.read_event();
            let (element, is_empty) = match event {
                Ok(Event::Start(ref e)) => (Some(e.clone()), false),
                Ok(Event::Empty(ref e)) => (Some(e.clone()), true),
                Ok(Event::End(ref e)) => {
                    if e.local_name().as_ref() == b"element" {
                        if let Some(true) = open_elements.pop() {
                            pending_field = None;
                        }
                    }
                    (None, false)
                }
                Ok(Event::Eof) => break,
                Err(err) => {
                    let offset = reader.error_position() as usize;
                    let (line, column) = LineIndex::new(xsd).position(xsd, offset);
                    return Err(ImportError::StructuralParse {
                        file: file_name.to_string(),
                        line,
                        column,
                        message: err.to_string(),
                    });
                }
                _ => (None, false),
            };

            let Some(e) = element else { continue };

            match e.local_name().as_ref() {
                b"element" => {
                    let name = attribute(&e, "name");
                    let reference = attribute(&e, "ref");

                    if open_elements.is_empty() {
                        if let Some(name) = name {
                            top_level.push(TopLevelElement {
                                name,
                                ..Default::default()
                            });
                        }
                        if !is_empty {
                            open_elements.push(false);
                        }
                        continue;
                    }

                    let is_field = name.is_some();
                    if let Some(current) = top_level.last_mut() {
                        if let Some(reference) = reference {
                            current.refs.push(reference);
                        } else if let Some(name) = name {
                            let field_type = attribute(&e, "type")
                                .map(|t| FieldType::from_xsd(&t))
                                .unwrap_or(FieldType::Text);
                            // XSD default for minOccurs is 1
                            let required = attribute(&e, "minOccurs")
                                .map(|m| m.trim() != "0")
                                .unwrap_or(true);
                            let mut field = FieldDefinition::new(name, field_type);
                            field.required = required;
                            current.fields.push(field);
                            if !is_empty {
                                pending_field = Some(current.fields.len() - 1);
                            }
                        }
                    }
                    if !is_empty {
                        open_elements.push(is_field);
                    }
                }
                b"restriction" => {
                    if let (Some(idx), Some(base)) = (pending_field, attribute(&e, "base")) {
                        if let Some(field) = top_level.last_mut().and_then(|t| t.fields.get_mut(idx)) {
                            field.field_type = FieldType::from_xsd(&base);
                        }
                    }
                }
                b"maxLength" => {
                    let length = attribute(&e, "value").and_then(|v| v.trim().parse::<usize>().ok());
                    if let (Some(idx), Some(length)) = (pending_field, length) {
                        if let Some(field) = top_level.last_mut().and_then(|t| t.fields.get_mut(idx)) {
                            field.max_length = Some(length);
                        }
                    }
                }
                _ => {}
            }
        }

        let root = top_level
            .iter()
            .find(|t| t.fields.is_empty() && !t.refs.is_empty());

        let record = root
            .and_then(|r| {
                r.refs
                    .iter()
                    .find_map(|name| top_level.iter().find(|t| &t.name == name && !t.fields.is_empty()))
            })
            .or_else(|| top_level.iter().find(|t| !t.fields.is_empty()));

        match record {
            Some(record) => Ok(SchemaDefinition {
                root: root.map(|r| r.name.clone()),
                record_element: record.name.clone(),
                fields: record.fields.clone(),
            }),
            None => Err(ImportError::StructuralParse {
                file: file_name.to_string(),
                line: 1,
                column: 1,
                message: "schema defines no record element with fields".to_string(),
            }),
        }
    }

    /// Look up a field by decoded logical name
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

fn attribute(element: &BytesStart, key: &str) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
}

// ============================================================================
// VALIDATION ERROR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub file: String,
    pub field: Option<String>,
    pub message: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl ValidationError {
    pub fn new(file: &str, field: Option<String>, message: impl Into<String>) -> Self {
        ValidationError {
            file: file.to_string(),
            field,
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(
        file: &str,
        field: Option<String>,
        message: impl Into<String>,
        line: usize,
        column: usize,
    ) -> Self {
        ValidationError {
            line: Some(line),
            column: Some(column),
            ..ValidationError::new(file, field, message)
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}", self.file)?;
        if let (Some(line), Some(column)) = (self.line, self.column) {
            write!(f, ":{}:{}", line, column)?;
        }
        write!(f, "] ")?;
        if let Some(field) = &self.field {
            write!(f, "{}: ", field)?;
        }
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidationError {}

// ============================================================================
// SCHEMA VALIDATOR
// ============================================================================

pub struct SchemaValidator {
    schema: SchemaDefinition,
}

impl SchemaValidator {
    pub fn new(schema: SchemaDefinition) -> Self {
        SchemaValidator { schema }
    }

    pub fn schema(&self) -> &SchemaDefinition {
        &self.schema
    }

    /// Validate one record in place.
    ///
    /// A missing required numeric field gets a `0` sentinel so the mapper
    /// can reject the record explicitly. Type mismatches keep the raw value;
    /// the mapper gets a chance at lenient formats. Values over a `maxLength`
    /// facet are reported and cut to it.
    pub fn validate(&self, record: &mut RawRecord) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let file = record.source_file.clone();
        let (line, column) = (record.line, record.column);
        let located = |field: &str, message: String| ValidationError {
            file: file.clone(),
            field: Some(field.to_string()),
            message,
            line,
            column,
        };

        for name in record.fields.keys() {
            if self.schema.field(name).is_none() {
                errors.push(located(name, "field is not defined by the schema".to_string()));
            }
        }

        let mut truncated: Vec<(String, String)> = Vec::new();
        for field in &self.schema.fields {
            match record.fields.get(&field.name) {
                None if field.required => {
                    errors.push(located(&field.name, "required field is missing".to_string()));
                    if field.field_type.is_numeric() {
                        record.fields.insert(field.name.clone(), "0".to_string());
                    }
                }
                None => {}
                Some(value) => {
                    if !field.field_type.accepts(value) {
                        errors.push(located(
                            &field.name,
                            format!("expected {}, got '{}'", field.field_type.name(), value),
                        ));
                    }
                    if let Some(max) = field.max_length {
                        let (cut, original_len) = truncate_chars(value, max);
                        if let Some(len) = original_len {
                            errors.push(located(
                                &field.name,
                                format!("{} characters exceeds maxLength {}; truncated", len, max),
                            ));
                            truncated.push((field.name.clone(), cut));
                        }
                    }
                }
            }
        }
        record.fields.extend(truncated);

        errors
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SourceKind;

    const ACCESS_STYLE_XSD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xsd:schema xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:od="urn:schemas-microsoft-com:officedata">
  <xsd:element name="dataroot">
    <xsd:complexType>
      <xsd:sequence>
        <xsd:element ref="Students" minOccurs="0" maxOccurs="unbounded"/>
      </xsd:sequence>
      <xsd:attribute name="generated" type="xsd:dateTime"/>
    </xsd:complexType>
  </xsd:element>
  <xsd:element name="Students">
    <xsd:complexType>
      <xsd:sequence>
        <xsd:element name="Student_x0020_Ref" minOccurs="1" od:jetType="longinteger" type="xsd:int"/>
        <xsd:element name="Last_x0020_Name" minOccurs="0">
          <xsd:simpleType>
            <xsd:restriction base="xsd:string">
              <xsd:maxLength value="50"/>
            </xsd:restriction>
          </xsd:simpleType>
        </xsd:element>
        <xsd:element name="Birth_x0020_Date" minOccurs="0" type="xsd:dateTime"/>
        <xsd:element name="Charge" minOccurs="0" type="xsd:decimal"/>
      </xsd:sequence>
    </xsd:complexType>
  </xsd:element>
</xsd:schema>"#;

    #[test]
    fn test_parse_access_style_schema() {
        let schema = SchemaDefinition::parse(ACCESS_STYLE_XSD, "students.xsd").unwrap();

        assert_eq!(schema.root.as_deref(), Some("dataroot"));
        assert_eq!(schema.record_element, "Students");
        assert_eq!(schema.fields.len(), 4);

        let student_ref = schema.field("Student Ref").unwrap();
        assert_eq!(student_ref.field_type, FieldType::Integer);
        assert!(student_ref.required);

        let last_name = schema.field("Last Name").unwrap();
        assert_eq!(last_name.xml_name, "Last_x0020_Name");
        assert_eq!(last_name.field_type, FieldType::Text);
        assert_eq!(last_name.max_length, Some(50));
        assert!(!last_name.required);

        assert_eq!(schema.field("Birth Date").unwrap().field_type, FieldType::Date);
    }

    #[test]
    fn test_schema_without_record_element_is_rejected() {
        let xsd = r#"<xsd:schema xmlns:xsd="http://www.w3.org/2001/XMLSchema"><xsd:element name="dataroot"/></xsd:schema>"#;
        let result = SchemaDefinition::parse(xsd, "empty.xsd");
        assert!(matches!(result, Err(ImportError::StructuralParse { .. })));
    }

    #[test]
    fn test_malformed_schema_reports_location() {
        let xsd = "<xsd:schema>\n  <xsd:element name=\"x\">\n</xsd:schema>";
        match SchemaDefinition::parse(xsd, "bad.xsd") {
            Err(ImportError::StructuralParse { line, .. }) => assert!(line >= 2),
            other => panic!("expected structural error, got {:?}", other),
        }
    }

    #[test]
    fn test_validator_collects_type_mismatch_and_unknown_fields() {
        let schema = SchemaDefinition::parse(ACCESS_STYLE_XSD, "students.xsd").unwrap();
        let validator = SchemaValidator::new(schema);

        let mut record = RawRecord::new(SourceKind::Student, "students.xml")
            .with_field("Student Ref", "12")
            .with_field("Charge", "$45,00")
            .with_field("Shoe Size", "9")
            .at(7, 3);

        let errors = validator.validate(&mut record);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.field.as_deref() == Some("Shoe Size")));
        let charge = errors.iter().find(|e| e.field.as_deref() == Some("Charge")).unwrap();
        assert_eq!(charge.line, Some(7));
        // Raw value kept for the mapper's lenient parsing
        assert_eq!(record.get("Charge"), Some("$45,00"));
    }

    #[test]
    fn test_validator_enforces_max_length_facet() {
        let schema = SchemaDefinition::parse(ACCESS_STYLE_XSD, "students.xsd").unwrap();
        let validator = SchemaValidator::new(schema);
        let long_name = "é".repeat(60);

        let mut record = RawRecord::new(SourceKind::Student, "students.xml")
            .with_field("Student Ref", "12")
            .with_field("Last Name", &long_name);

        let errors = validator.validate(&mut record);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field.as_deref(), Some("Last Name"));
        assert!(errors[0].message.contains("maxLength 50"));
        assert_eq!(record.get("Last Name").map(|v| v.chars().count()), Some(50));

        let mut short = RawRecord::new(SourceKind::Student, "students.xml")
            .with_field("Student Ref", "13")
            .with_field("Last Name", "Roy");
        assert!(validator.validate(&mut short).is_empty());
        println!("✅ maxLength facet PASSED");
    }

    #[test]
    fn test_field_type_from_xsd() {
        assert_eq!(FieldType::from_xsd("xsd:int"), FieldType::Integer);
        assert_eq!(FieldType::from_xsd("double"), FieldType::Decimal);
        assert_eq!(FieldType::from_xsd("xs:dateTime"), FieldType::Date);
        assert_eq!(FieldType::from_xsd("xsd:boolean"), FieldType::Boolean);
        assert_eq!(FieldType::from_xsd("xsd:base64Binary"), FieldType::Text);
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::at("schools.xml", Some("Code".to_string()), "required field is missing", 4, 2);
        assert_eq!(err.to_string(), "[schools.xml:4:2] Code: required field is missing");
    }
}
