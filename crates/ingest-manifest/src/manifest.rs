use crate::error::ManifestError;
use crate::loader::DocumentLoader;
use crate::spec::{ContributionSpec, TableContributionsSpec, TableSpec};
use ingest_core::{FileFormat, FileFormats};
use serde_json::Value;

/// The static, read-only description of a dataset, expanded from a remote
/// (or local-file) `metadata.json`.
#[derive(Debug, Clone)]
pub struct Manifest {
    database: String,
    num_stripes: u32,
    num_sub_stripes: u32,
    charset_name: String,
    database_json: Value,
    tables: Vec<TableSpec>,
    formats: FileFormats,
}

impl Manifest {
    /// Fetches `metadata_url` and everything it references, expanding it
    /// into a [`Manifest`]. Validates the declared manifest version against
    /// `[min_supported_version, max_supported_version]` before doing any
    /// further work.
    pub async fn load(
        metadata_url: &str,
        database: &str,
        num_stripes: u32,
        num_sub_stripes: u32,
        loader: &dyn DocumentLoader,
        min_supported_version: i32,
        max_supported_version: i32,
    ) -> Result<Manifest, ManifestError> {
        let metadata = loader.fetch_json(metadata_url).await?;

        let version = metadata
            .get("version")
            .and_then(Value::as_i64)
            .ok_or_else(|| ManifestError::MissingField {
                url: metadata_url.to_string(),
                field: "version",
            })? as i32;

        if version < min_supported_version || version > max_supported_version {
            return Err(ManifestError::UnsupportedVersion {
                found: version,
                min: min_supported_version,
                max: max_supported_version,
            });
        }

        let database_ref = metadata
            .get("database")
            .and_then(Value::as_str)
            .ok_or_else(|| ManifestError::MissingField {
                url: metadata_url.to_string(),
                field: "database",
            })?;
        let database_json = loader.fetch_json(&resolve(metadata_url, database_ref)).await?;

        let charset_name = metadata
            .get("charset_name")
            .and_then(Value::as_str)
            .unwrap_or("latin1")
            .to_string();

        let mut formats = FileFormats::with_defaults();
        if let Some(overrides) = metadata.get("formats").and_then(Value::as_object) {
            for (extension, value) in overrides {
                formats.overlay(extension, parse_file_format(value));
            }
        }

        let table_entries = metadata
            .get("tables")
            .and_then(Value::as_array)
            .ok_or_else(|| ManifestError::MissingField {
                url: metadata_url.to_string(),
                field: "tables",
            })?;

        let mut directors = Vec::new();
        let mut dependents = Vec::new();
        for entry in table_entries {
            let table = load_table_spec(metadata_url, entry, loader).await?;
            if table.director {
                directors.push(table);
            } else {
                dependents.push(table);
            }
        }
        // Director tables are ingested before their dependents.
        directors.extend(dependents);

        Ok(Manifest {
            database: database.to_string(),
            num_stripes,
            num_sub_stripes,
            charset_name,
            database_json,
            tables: directors,
            formats,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// `layout_{num_stripes}_{num_sub_stripes}`.
    pub fn family(&self) -> String {
        format!("layout_{}_{}", self.num_stripes, self.num_sub_stripes)
    }

    pub fn charset_name(&self) -> &str {
        &self.charset_name
    }

    pub fn database_json(&self) -> &Value {
        &self.database_json
    }

    /// Table names, director tables first.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Table schema JSONs in ingest order, director tables first.
    pub fn ordered_tables_json(&self) -> Vec<&Value> {
        self.tables.iter().map(|t| &t.schema_json).collect()
    }

    pub fn json_indexes(&self) -> Vec<&Value> {
        self.tables.iter().flat_map(|t| t.index_jsons.iter()).collect()
    }

    pub fn formats(&self) -> &FileFormats {
        &self.formats
    }

    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    /// Lazily yields every [`ContributionSpec`] this manifest describes,
    /// across all tables in ingest order.
    pub fn contributions(&self) -> impl Iterator<Item = ContributionSpec> + '_ {
        self.tables.iter().flat_map(move |t| t.get_contrib(&self.database))
    }
}

async fn load_table_spec(
    metadata_url: &str,
    entry: &Value,
    loader: &dyn DocumentLoader,
) -> Result<TableSpec, ManifestError> {
    let schema_ref = entry
        .get("schema")
        .and_then(Value::as_str)
        .ok_or_else(|| ManifestError::MissingField {
            url: metadata_url.to_string(),
            field: "schema",
        })?;
    let schema_json = loader.fetch_json(&resolve(metadata_url, schema_ref)).await?;

    let mut index_jsons = Vec::new();
    if let Some(indexes) = entry.get("indexes").and_then(Value::as_array) {
        for index_ref in indexes {
            let index_ref = index_ref.as_str().ok_or_else(|| ManifestError::MissingField {
                url: metadata_url.to_string(),
                field: "indexes[]",
            })?;
            index_jsons.push(loader.fetch_json(&resolve(metadata_url, index_ref)).await?);
        }
    }

    let name = schema_json
        .get("table")
        .and_then(Value::as_str)
        .ok_or_else(|| ManifestError::MissingField {
            url: metadata_url.to_string(),
            field: "schema.table",
        })?
        .to_string();

    // A director table's schema has no `director_table` field, or an empty one.
    let director = match schema_json.get("director_table") {
        None => true,
        Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(_) => false,
    };

    let data = entry
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| ManifestError::MissingField {
            url: metadata_url.to_string(),
            field: "data",
        })?;

    let contributions = data
        .iter()
        .map(|d| parse_table_contributions(metadata_url, d))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TableSpec {
        name,
        schema_json,
        index_jsons,
        director,
        contributions,
    })
}

fn parse_table_contributions(
    metadata_url: &str,
    entry: &Value,
) -> Result<TableContributionsSpec, ManifestError> {
    let directory = entry
        .get("directory")
        .and_then(Value::as_str)
        .ok_or_else(|| ManifestError::MissingField {
            url: metadata_url.to_string(),
            field: "data[].directory",
        })?
        .to_string();

    let to_i32_vec = |v: &Value| -> Option<Vec<i32>> {
        v.as_array()
            .map(|a| a.iter().filter_map(Value::as_i64).map(|i| i as i32).collect())
    };

    let chunks = entry.get("chunks").and_then(to_i32_vec);
    let overlaps = entry.get("overlaps").and_then(to_i32_vec);
    let files = entry.get("files").and_then(|v| {
        v.as_array()
            .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
    });

    Ok(TableContributionsSpec {
        directory,
        chunks,
        overlaps,
        files,
    })
}

fn parse_file_format(value: &Value) -> FileFormat {
    let get = |key: &str| value.get(key).and_then(Value::as_str).map(String::from);
    FileFormat {
        fields_enclosed_by: get("fields_enclosed_by"),
        fields_escaped_by: get("fields_escaped_by"),
        fields_terminated_by: get("fields_terminated_by"),
        lines_terminated_by: get("lines_terminated_by"),
    }
}

/// Resolves `relative` against the directory containing `base_url`,
/// supporting both remote (`http(s)://`) and local-path manifests.
fn resolve(base_url: &str, relative: &str) -> String {
    if relative.contains("://") {
        return relative.to_string();
    }
    if let Ok(base) = url::Url::parse(base_url) {
        if let Ok(joined) = base.join(relative) {
            return joined.to_string();
        }
    }
    let dir = match base_url.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    };
    format!("{dir}/{relative}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeLoader(Mutex<HashMap<String, Value>>);

    #[async_trait]
    impl DocumentLoader for FakeLoader {
        async fn fetch_json(&self, url: &str) -> Result<Value, ManifestError> {
            self.0
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| ManifestError::MissingField {
                    url: url.to_string(),
                    field: "<not seeded in fake loader>",
                })
        }
    }

    fn fake(docs: &[(&str, Value)]) -> FakeLoader {
        FakeLoader(Mutex::new(docs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()))
    }

    #[tokio::test]
    async fn director_tables_come_first() {
        let loader = fake(&[
            (
                "http://host/metadata.json",
                json!({
                    "version": 2,
                    "database": "db.json",
                    "tables": [
                        {"schema": "source.json", "indexes": [], "data": []},
                        {"schema": "object.json", "indexes": [], "data": []},
                    ]
                }),
            ),
            ("http://host/db.json", json!({"database": "gaia"})),
            ("http://host/source.json", json!({"table": "Source", "director_table": "Object"})),
            ("http://host/object.json", json!({"table": "Object"})),
        ]);

        let manifest = Manifest::load("http://host/metadata.json", "gaia", 340, 3, &loader, 1, 10)
            .await
            .unwrap();

        assert_eq!(manifest.table_names(), vec!["Object", "Source"]);
    }

    #[tokio::test]
    async fn rejects_unsupported_version() {
        let loader = fake(&[(
            "http://host/metadata.json",
            json!({"version": 0, "database": "db.json", "tables": []}),
        )]);

        let err = Manifest::load("http://host/metadata.json", "gaia", 340, 3, &loader, 1, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::UnsupportedVersion { .. }));
    }

    #[tokio::test]
    async fn expands_regular_and_partitioned_contributions() {
        let loader = fake(&[
            (
                "http://host/metadata.json",
                json!({
                    "version": 2,
                    "database": "db.json",
                    "tables": [
                        {"schema": "object.json", "indexes": [], "data": [
                            {"directory": "data/object", "chunks": [1, 2], "overlaps": [1]}
                        ]},
                        {"schema": "logs.json", "indexes": [], "data": [
                            {"directory": "data/logs", "files": ["a.tsv", "b.tsv"]}
                        ]},
                    ]
                }),
            ),
            ("http://host/db.json", json!({"database": "gaia"})),
            ("http://host/object.json", json!({"table": "Object"})),
            ("http://host/logs.json", json!({"table": "Logs", "director_table": "Object"})),
        ]);

        let manifest = Manifest::load("http://host/metadata.json", "gaia", 340, 3, &loader, 1, 10)
            .await
            .unwrap();

        let contribs: Vec<_> = manifest.contributions().collect();
        // Object: 2 chunks + 1 overlap = 3. Logs: 2 files = 2. Total 5.
        assert_eq!(contribs.len(), 5);
        assert_eq!(manifest.family(), "layout_340_3");
    }
}
