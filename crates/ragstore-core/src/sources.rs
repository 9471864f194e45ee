//! Document source connectors
//!
//! Sources turn external data into [`DocumentRecord`]s. The index never
//! depends on a particular source; this module only ships plain text files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::{IndexError, IndexResult};
use super::types::{keys, DocumentRecord};

/// Summary of what a source has loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSummary {
    pub source_name: String,
    pub document_count: usize,
    pub total_characters: usize,
}

pub trait DocumentSource {
    fn source_name(&self) -> &str;

    /// Whether the source is reachable and supported
    fn validate(&self) -> bool;

    /// Load (or reload) the source's documents
    fn load(&mut self) -> IndexResult<Vec<DocumentRecord>>;

    /// Documents from the last successful load
    fn documents(&self) -> &[DocumentRecord];

    /// Forget loaded documents
    fn clear(&mut self);

    fn summary(&self) -> SourceSummary {
        SourceSummary {
            source_name: self.source_name().to_string(),
            document_count: self.documents().len(),
            total_characters: self
                .documents()
                .iter()
                .map(|doc| doc.text.chars().count())
                .sum(),
        }
    }
}

const TEXT_EXTENSIONS: [&str; 2] = ["txt", "md"];

/// How a text file's bytes are decoded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    /// Invalid UTF-8 is a validation error
    #[default]
    Utf8,
    /// Invalid sequences become U+FFFD
    Utf8Lossy,
    /// ISO-8859-1: every byte is the code point of the same value
    Latin1,
}

impl TextEncoding {
    /// Accepts the usual labels: `utf-8`, `utf8`, `utf-8-lossy`, `latin-1`,
    /// `latin1`, `iso-8859-1`
    pub fn parse(label: &str) -> IndexResult<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "utf-8-lossy" | "utf8-lossy" => Ok(Self::Utf8Lossy),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(Self::Latin1),
            other => Err(IndexError::Configuration(format!(
                "unsupported text encoding '{other}'"
            ))),
        }
    }

    fn decode(&self, bytes: Vec<u8>, path: &Path) -> IndexResult<String> {
        match self {
            Self::Utf8 => String::from_utf8(bytes).map_err(|e| {
                IndexError::Validation(format!("{} is not valid UTF-8: {}", path.display(), e))
            }),
            Self::Utf8Lossy => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Self::Latin1 => Ok(bytes.into_iter().map(char::from).collect()),
        }
    }
}

/// A single `.txt` or `.md` file, decoded as UTF-8 unless another
/// [`TextEncoding`] is given
#[derive(Debug, Clone)]
pub struct TextFileSource {
    name: String,
    file_path: PathBuf,
    encoding: TextEncoding,
    documents: Vec<DocumentRecord>,
}

impl TextFileSource {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        let file_path = file_path.into();
        Self {
            name: format!("Textfile: {}", file_path.display()),
            file_path,
            encoding: TextEncoding::default(),
            documents: Vec::new(),
        }
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }
}

impl DocumentSource for TextFileSource {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> bool {
        let supported = self
            .file_path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        supported && self.file_path.is_file()
    }

    fn load(&mut self) -> IndexResult<Vec<DocumentRecord>> {
        if !self.validate() {
            return Err(IndexError::Validation(format!(
                "Invalid file path {}",
                self.file_path.display()
            )));
        }

        let bytes = std::fs::read(&self.file_path)?;
        let text = self.encoding.decode(bytes, &self.file_path)?;
        let path = self.file_path.to_string_lossy().to_string();
        let file_name = self
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let record = DocumentRecord::new(text)
            .with_metadata(keys::SOURCE, path.clone())
            .with_metadata(keys::SOURCE_TYPE, "text")
            .with_metadata("file_name", file_name)
            .with_metadata(keys::FILE_PATH, path);

        self.documents = vec![record];
        Ok(self.documents.clone())
    }

    fn documents(&self) -> &[DocumentRecord] {
        &self.documents
    }

    fn clear(&mut self) {
        self.documents.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetadataValue;
    use tempfile::TempDir;

    #[test]
    fn test_loads_text_file_with_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# Notes\n\nSome text.").unwrap();

        let mut source = TextFileSource::new(&path);
        let docs = source.load().unwrap();

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].metadata["file_name"], MetadataValue::from("notes.md"));
        assert_eq!(docs[0].metadata[keys::SOURCE_TYPE], MetadataValue::from("text"));
        assert_eq!(docs[0].source(), Some(path.to_string_lossy().as_ref()));

        let summary = source.summary();
        assert_eq!(summary.document_count, 1);
        assert_eq!(summary.total_characters, 19);

        source.clear();
        assert_eq!(source.summary().document_count, 0);
    }

    #[test]
    fn test_decodes_with_configured_encoding() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.txt");
        // "café" in ISO-8859-1
        std::fs::write(&path, [b'c', b'a', b'f', 0xe9]).unwrap();

        let err = TextFileSource::new(&path).load().unwrap_err();
        assert!(matches!(err, IndexError::Validation(_)));

        let latin1 = TextFileSource::new(&path)
            .with_encoding(TextEncoding::parse("ISO-8859-1").unwrap())
            .load()
            .unwrap();
        assert_eq!(latin1[0].text, "café");

        let lossy = TextFileSource::new(&path)
            .with_encoding(TextEncoding::Utf8Lossy)
            .load()
            .unwrap();
        assert_eq!(lossy[0].text, "caf\u{FFFD}");

        assert!(matches!(
            TextEncoding::parse("shift_jis"),
            Err(IndexError::Configuration(_))
        ));
    }

    #[test]
    fn test_rejects_unsupported_or_missing_files() {
        let dir = TempDir::new().unwrap();
        let pdf = dir.path().join("paper.pdf");
        std::fs::write(&pdf, "%PDF").unwrap();

        assert!(!TextFileSource::new(&pdf).validate());
        assert!(matches!(
            TextFileSource::new(&pdf).load(),
            Err(IndexError::Validation(_))
        ));
        assert!(!TextFileSource::new(dir.path().join("missing.txt")).validate());
    }
}
