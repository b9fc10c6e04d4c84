use serde::Serialize;
use std::collections::BTreeMap;

/// Per-extension overrides for the server's `LOAD DATA INFILE` parameters.
///
/// Field names match the wire payload keys expected by the ingest server,
/// not idiomatic Rust naming, since these are serialized verbatim into the
/// `file-async` submission payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileFormat {
    #[serde(rename = "fields_enclosed_by", skip_serializing_if = "Option::is_none")]
    pub fields_enclosed_by: Option<String>,
    #[serde(rename = "fields_escaped_by", skip_serializing_if = "Option::is_none")]
    pub fields_escaped_by: Option<String>,
    #[serde(rename = "column_separator", skip_serializing_if = "Option::is_none")]
    pub fields_terminated_by: Option<String>,
    #[serde(rename = "lines_terminated_by", skip_serializing_if = "Option::is_none")]
    pub lines_terminated_by: Option<String>,
}

/// A map of file extension ("csv", "tsv", "txt", ...) to its [`FileFormat`]
/// override, pre-populated with the defaults (csv -> `,`, tsv -> `\t`, txt ->
/// unset) and overlaid with whatever a manifest's `formats` block supplies.
#[derive(Debug, Clone, Default)]
pub struct FileFormats(BTreeMap<String, FileFormat>);

impl FileFormats {
    /// Build the default table: csv -> `,`, tsv -> `\t`, txt -> unset.
    pub fn with_defaults() -> Self {
        let mut map = BTreeMap::new();
        map.insert(
            "csv".to_string(),
            FileFormat {
                fields_terminated_by: Some(",".to_string()),
                ..Default::default()
            },
        );
        map.insert(
            "tsv".to_string(),
            FileFormat {
                fields_terminated_by: Some("\t".to_string()),
                ..Default::default()
            },
        );
        map.insert("txt".to_string(), FileFormat::default());
        Self(map)
    }

    /// Overlay manifest-supplied overrides onto the defaults, keyed by extension.
    pub fn overlay(&mut self, extension: &str, format: FileFormat) {
        self.0.insert(extension.to_string(), format);
    }

    /// Look up the format for a file's extension, if one is known.
    pub fn get(&self, extension: &str) -> Option<&FileFormat> {
        self.0.get(extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let formats = FileFormats::with_defaults();
        assert_eq!(
            formats.get("csv").unwrap().fields_terminated_by.as_deref(),
            Some(",")
        );
        assert_eq!(
            formats.get("tsv").unwrap().fields_terminated_by.as_deref(),
            Some("\t")
        );
        assert_eq!(formats.get("txt").unwrap(), &FileFormat::default());
        assert!(formats.get("unknown").is_none());
    }

    #[test]
    fn overlay_replaces_default() {
        let mut formats = FileFormats::with_defaults();
        formats.overlay(
            "csv",
            FileFormat {
                fields_terminated_by: Some(";".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(
            formats.get("csv").unwrap().fields_terminated_by.as_deref(),
            Some(";")
        );
    }
}
