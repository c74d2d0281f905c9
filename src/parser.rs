// 🏗️ Schema-Validating Reader
// Reads one legacy XML export against its XSD definition and yields raw
// field-string records lazily, collecting validation errors on the side.

use crate::error::ImportError;
use crate::schema::{SchemaDefinition, SchemaValidator, ValidationError};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

// ============================================================================
// CORE TYPES
// ============================================================================

/// SourceKind - which legacy export a document holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    School,
    ClassGroup,
    Activity,
    Student,
}

impl SourceKind {
    /// All source kinds, in write (dependency) order
    pub const ALL: [SourceKind; 4] = [
        SourceKind::School,
        SourceKind::ClassGroup,
        SourceKind::Activity,
        SourceKind::Student,
    ];

    /// Human-readable name for display
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::School => "School",
            SourceKind::ClassGroup => "Class Group",
            SourceKind::Activity => "Activity",
            SourceKind::Student => "Student",
        }
    }

    /// Logical field holding the natural (legacy) key
    pub fn natural_key_field(&self) -> &'static str {
        match self {
            SourceKind::School | SourceKind::ClassGroup | SourceKind::Activity => "Code",
            SourceKind::Student => "Student Ref",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// RawRecord - one source row as a bag of trimmed, non-empty strings
///
/// Field names are already decoded (`Code_x0020_School` → `Code School`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub kind: SourceKind,
    pub fields: BTreeMap<String, String>,
    pub source_file: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl RawRecord {
    pub fn new(kind: SourceKind, source_file: impl Into<String>) -> Self {
        RawRecord {
            kind,
            fields: BTreeMap::new(),
            source_file: source_file.into(),
            line: None,
            column: None,
        }
    }

    /// Builder: add a field (normalized; blank values are dropped)
    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        if let Some(v) = normalize_value(value) {
            self.fields.insert(name.to_string(), v);
        }
        self
    }

    /// Builder: add position in the source document
    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(|s| s.as_str())
    }

    /// Value of the natural key field, if present
    pub fn natural_key(&self) -> Option<&str> {
        self.get(self.kind.natural_key_field())
    }
}

// ============================================================================
// NORMALIZATION HELPERS
// ============================================================================

/// Empty or whitespace-only → None, otherwise trimmed
pub fn normalize_value(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Decode XML-encoded identifiers: `_xHHHH_` → the character U+HHHH
///
/// Legacy exporters encode spaces and leading digits this way
/// (`Code_x0020_School`, `_x0031_st_x0020_Payment`).
pub fn decode_field_name(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = String::with_capacity(encoded.len());
    let mut i = 0;

    while i < encoded.len() {
        if bytes[i] == b'_' && i + 7 <= encoded.len() && bytes[i + 1] == b'x' && bytes[i + 6] == b'_'
        {
            let decoded = encoded
                .get(i + 2..i + 6)
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .and_then(char::from_u32);
            if let Some(ch) = decoded {
                out.push(ch);
                i += 7;
                continue;
            }
        }

        // Not an escape: copy one full character
        let ch = encoded[i..].chars().next().unwrap_or('_');
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

/// Byte offset → 1-based (line, column)
pub(crate) struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub(crate) fn new(content: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            content
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i + 1),
        );
        LineIndex { line_starts }
    }

    pub(crate) fn position(&self, content: &str, offset: usize) -> (usize, usize) {
        let offset = offset.min(content.len());
        let line_idx = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let line_start = self.line_starts[line_idx];
        let column = content
            .get(line_start..offset)
            .map(|s| s.chars().count())
            .unwrap_or(offset - line_start);
        (line_idx + 1, column + 1)
    }
}

// ============================================================================
// DOCUMENT READER
// ============================================================================

#[derive(Debug, Clone)]
struct RecordSpan {
    start: usize,
    end: usize,
}

struct Scan {
    spans: Vec<RecordSpan>,
    stray: Vec<(String, usize)>,
}

/// Open a document against its schema definition.
///
/// Missing document or schema → `ImportError::MissingInput` (fatal to the
/// run). A malformed document is NOT an error here: the stream yields zero
/// records and carries one ValidationError with the parse location.
pub fn read_document(
    kind: SourceKind,
    document_path: &Path,
    schema_path: &Path,
) -> Result<RecordStream, ImportError> {
    if !schema_path.is_file() {
        return Err(ImportError::MissingInput(schema_path.to_path_buf()));
    }
    if !document_path.is_file() {
        return Err(ImportError::MissingInput(document_path.to_path_buf()));
    }

    let schema = SchemaDefinition::load(schema_path)?;
    let content = std::fs::read_to_string(document_path)?;
    let file_name = document_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.xml")
        .to_string();

    Ok(RecordStream::new(kind, file_name, content, schema))
}

/// Lazy, non-restartable sequence of RawRecords from one document
pub struct RecordStream {
    kind: SourceKind,
    file_name: String,
    content: String,
    lines: LineIndex,
    spans: std::vec::IntoIter<RecordSpan>,
    validator: SchemaValidator,
    errors: Vec<ValidationError>,
    records_read: usize,
}

impl RecordStream {
    pub fn new(
        kind: SourceKind,
        file_name: String,
        content: String,
        schema: SchemaDefinition,
    ) -> Self {
        let lines = LineIndex::new(&content);
        let mut errors = Vec::new();

        let spans = match scan_records(&content, &schema.record_element) {
            Ok(scan) => {
                for (name, offset) in scan.stray {
                    let (line, column) = lines.position(&content, offset);
                    errors.push(ValidationError::at(
                        &file_name,
                        None,
                        format!(
                            "unexpected element <{}>, expected <{}>",
                            name, schema.record_element
                        ),
                        line,
                        column,
                    ));
                }
                scan.spans
            }
            Err((message, offset)) => {
                let (line, column) = lines.position(&content, offset);
                warn!(file = %file_name, line, column, "malformed document: {}", message);
                errors.push(ValidationError::at(
                    &file_name,
                    None,
                    format!("malformed document: {}", message),
                    line,
                    column,
                ));
                Vec::new()
            }
        };

        debug!(file = %file_name, records = spans.len(), "document scanned");

        RecordStream {
            kind,
            file_name,
            content,
            lines,
            spans: spans.into_iter(),
            validator: SchemaValidator::new(schema),
            errors,
            records_read: 0,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Errors collected so far (grows while iterating)
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<ValidationError> {
        std::mem::take(&mut self.errors)
    }

    pub fn records_read(&self) -> usize {
        self.records_read
    }

    fn parse_record(&mut self, span: RecordSpan) -> RawRecord {
        let slice = &self.content[span.start..span.end];
        let (line, column) = self.lines.position(&self.content, span.start);
        let mut record = RawRecord::new(self.kind, self.file_name.clone()).at(line, column);

        let mut reader = Reader::from_str(slice);
        reader.config_mut().trim_text(true);

        let mut depth = 0usize;
        let mut field: Option<String> = None;
        let mut value = String::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    depth += 1;
                    if depth == 2 {
                        field = Some(decode_field_name(&String::from_utf8_lossy(
                            e.local_name().as_ref(),
                        )));
                        value.clear();
                    }
                }
                Ok(Event::Text(t)) if depth == 2 => match t.unescape() {
                    Ok(text) => value.push_str(&text),
                    Err(err) => self.errors.push(ValidationError::at(
                        &self.file_name,
                        field.clone(),
                        format!("unreadable value: {}", err),
                        line,
                        column,
                    )),
                },
                Ok(Event::CData(c)) if depth == 2 => {
                    value.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
                Ok(Event::End(_)) => {
                    if depth == 2 {
                        if let (Some(name), Some(v)) = (field.take(), normalize_value(&value)) {
                            record.fields.insert(name, v);
                        }
                    }
                    depth = depth.saturating_sub(1);
                }
                Ok(Event::Eof) => break,
                Err(err) => {
                    // The structural scan already accepted this span
                    self.errors.push(ValidationError::at(
                        &self.file_name,
                        None,
                        format!("unreadable record: {}", err),
                        line,
                        column,
                    ));
                    break;
                }
                _ => {}
            }
        }

        let schema_errors = self.validator.validate(&mut record);
        self.errors.extend(schema_errors);
        record
    }
}

impl Iterator for RecordStream {
    type Item = RawRecord;

    fn next(&mut self) -> Option<RawRecord> {
        let span = self.spans.next()?;
        self.records_read += 1;
        Some(self.parse_record(span))
    }
}

/// Well-formedness pass: locate every record element under the root.
///
/// Err carries (message, byte offset) for the first structural problem.
fn scan_records(content: &str, record_element: &str) -> Result<Scan, (String, usize)> {
    let mut reader = Reader::from_str(content);

    let mut spans = Vec::new();
    let mut stray = Vec::new();
    let mut depth = 0usize;
    let mut saw_root = false;
    let mut open: Option<(usize, bool)> = None;

    loop {
        let before = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                if depth == 1 {
                    saw_root = true;
                } else if depth == 2 {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                    let is_record = name == record_element;
                    if !is_record {
                        stray.push((name, before));
                    }
                    open = Some((before, is_record));
                }
            }
            Ok(Event::Empty(e)) => {
                if depth == 0 {
                    saw_root = true;
                } else if depth == 1 {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                    if name == record_element {
                        spans.push(RecordSpan {
                            start: before,
                            end: reader.buffer_position() as usize,
                        });
                    } else {
                        stray.push((name, before));
                    }
                }
            }
            Ok(Event::End(_)) => {
                if depth == 2 {
                    if let Some((start, true)) = open.take() {
                        spans.push(RecordSpan {
                            start,
                            end: reader.buffer_position() as usize,
                        });
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => {
                if depth > 0 {
                    return Err((
                        format!("unexpected end of document, {} element(s) left open", depth),
                        content.len(),
                    ));
                }
                if !saw_root {
                    return Err(("document has no root element".to_string(), 0));
                }
                break;
            }
            Err(e) => return Err((e.to_string(), reader.error_position() as usize)),
            _ => {}
        }
    }

    Ok(Scan { spans, stray })
}

// ============================================================================
// TESTS
// ============================================================================
