use std::path::Path;

/// One row of work: a single input file destined for one (database, table,
/// chunk, overlap) slot. Queue-assigned
/// fields (`id`, `locking_worker`, `succeed`) are filled in once the spec is
/// inserted into [`ingest_queue`]; here it carries only the static
/// description derived from the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributionSpec {
    pub database: String,
    pub table: String,
    pub chunk_id: Option<i32>,
    pub filepath: String,
    pub is_overlap: Option<bool>,
}

impl ContributionSpec {
    pub fn extension(&self) -> &str {
        Path::new(&self.filepath)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
    }

    /// Payload encoding of `chunk_id`/`is_overlap` for the wire protocol:
    /// absent maps to `-1`.
    pub fn chunk_payload(&self) -> i64 {
        self.chunk_id.map(|c| c as i64).unwrap_or(-1)
    }

    pub fn overlap_payload(&self) -> i64 {
        match self.is_overlap {
            Some(true) => 1,
            Some(false) => 0,
            None => -1,
        }
    }
}

/// Describes one directory's worth of contributions for one table: either a
/// flat list of regular-table `files`, or a partitioned table's `chunks`
/// (plus `overlaps` for director tables).
#[derive(Debug, Clone, Default)]
pub struct TableContributionsSpec {
    pub directory: String,
    pub chunks: Option<Vec<i32>>,
    pub overlaps: Option<Vec<i32>>,
    pub files: Option<Vec<String>>,
}

impl TableContributionsSpec {
    /// Lazily yields one [`ContributionSpec`] per file this directory
    /// contributes to `table`. `director` selects whether overlap rows
    /// are also produced.
    pub fn get_contrib<'a>(
        &'a self,
        database: &'a str,
        table: &'a str,
        director: bool,
    ) -> impl Iterator<Item = ContributionSpec> + 'a {
        let regular = self.files.iter().flatten().map(move |filename| ContributionSpec {
            database: database.to_string(),
            table: table.to_string(),
            chunk_id: None,
            is_overlap: None,
            filepath: join(&self.directory, filename),
        });

        let chunks = self.chunks.iter().flatten().map(move |&chunk_id| ContributionSpec {
            database: database.to_string(),
            table: table.to_string(),
            chunk_id: Some(chunk_id),
            is_overlap: Some(false),
            filepath: join(&self.directory, &format!("chunk_{chunk_id}.txt")),
        });

        let overlaps: Box<dyn Iterator<Item = ContributionSpec>> = if director {
            let overlap_ids: &[i32] = self
                .overlaps
                .as_deref()
                .or(self.chunks.as_deref())
                .unwrap_or(&[]);
            Box::new(
                overlap_ids
                    .to_vec()
                    .into_iter()
                    .map(move |chunk_id| ContributionSpec {
                        database: database.to_string(),
                        table: table.to_string(),
                        chunk_id: Some(chunk_id),
                        is_overlap: Some(true),
                        filepath: join(&self.directory, &format!("chunk_{chunk_id}_overlap.txt")),
                    }),
            )
        } else {
            Box::new(std::iter::empty())
        };

        regular.chain(chunks).chain(overlaps)
    }
}

fn join(directory: &str, filename: &str) -> String {
    format!("{}/{}", directory.trim_end_matches('/'), filename.trim_start_matches('/'))
}

/// The static, read-only description of one table in the dataset.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    pub schema_json: serde_json::Value,
    pub index_jsons: Vec<serde_json::Value>,
    pub director: bool,
    pub contributions: Vec<TableContributionsSpec>,
}

impl TableSpec {
    pub fn get_contrib<'a>(&'a self, database: &'a str) -> impl Iterator<Item = ContributionSpec> + 'a {
        self.contributions
            .iter()
            .flat_map(move |c| c.get_contrib(database, &self.name, self.director))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_table_one_per_file() {
        let spec = TableContributionsSpec {
            directory: "data/logs".to_string(),
            files: Some(vec!["logs.tsv".to_string()]),
            ..Default::default()
        };
        let got: Vec<_> = spec.get_contrib("db", "Logs", false).collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].filepath, "data/logs/logs.tsv");
        assert_eq!(got[0].chunk_id, None);
        assert_eq!(got[0].is_overlap, None);
    }

    #[test]
    fn partitioned_table_one_per_chunk() {
        let spec = TableContributionsSpec {
            directory: "data/object".to_string(),
            chunks: Some(vec![1, 2]),
            ..Default::default()
        };
        let got: Vec<_> = spec.get_contrib("db", "Source", false).collect();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].filepath, "data/object/chunk_1.txt");
        assert_eq!(got[0].is_overlap, Some(false));
    }

    #[test]
    fn director_table_adds_overlaps_defaulting_to_chunks() {
        let spec = TableContributionsSpec {
            directory: "data/object".to_string(),
            chunks: Some(vec![1, 2]),
            ..Default::default()
        };
        let got: Vec<_> = spec.get_contrib("db", "Object", true).collect();
        assert_eq!(got.len(), 4);
        let overlaps: Vec<_> = got.iter().filter(|c| c.is_overlap == Some(true)).collect();
        assert_eq!(overlaps.len(), 2);
        assert_eq!(overlaps[0].filepath, "data/object/chunk_1_overlap.txt");
    }

    #[test]
    fn director_table_respects_explicit_overlaps_list() {
        let spec = TableContributionsSpec {
            directory: "data/object".to_string(),
            chunks: Some(vec![1, 2, 3]),
            overlaps: Some(vec![1]),
            ..Default::default()
        };
        let got: Vec<_> = spec.get_contrib("db", "Object", true).collect();
        let overlaps: Vec<_> = got.iter().filter(|c| c.is_overlap == Some(true)).collect();
        assert_eq!(overlaps.len(), 1);
        assert_eq!(overlaps[0].chunk_id, Some(1));
    }

    #[test]
    fn chunk_payload_maps_absent_to_negative_one() {
        let spec = ContributionSpec {
            database: "db".into(),
            table: "t".into(),
            chunk_id: None,
            filepath: "x".into(),
            is_overlap: None,
        };
        assert_eq!(spec.chunk_payload(), -1);
        assert_eq!(spec.overlap_payload(), -1);
    }
}
