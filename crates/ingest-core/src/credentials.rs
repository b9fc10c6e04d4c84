use anyhow::Context;
use std::path::{Path, PathBuf};

/// Reads the `auth_key` used to authenticate with the ingest server.
///
/// The key lives as the sole line of a plain text file at `path`. When the
/// file is absent, falls back to an interactive, echo-free prompt on stdin
/// (acceptable for foreground usage only, not for unattended pods).
#[derive(Debug, Clone)]
pub struct Credentials {
    path: PathBuf,
}

impl Credentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the auth key, prompting interactively if the credentials file
    /// does not exist.
    pub fn load(&self) -> anyhow::Result<String> {
        match read_key_file(&self.path) {
            Ok(key) => Ok(key),
            Err(err) if is_not_found(&err) => {
                tracing::debug!(path = %self.path.display(), "credentials file not found, prompting");
                rpassword::prompt_password("Enter auth_key: ").context("reading auth_key from stdin")
            }
            Err(err) => Err(err).with_context(|| {
                format!("reading credentials file {}", self.path.display())
            }),
        }
    }
}

fn read_key_file(path: &Path) -> std::io::Result<String> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.trim().to_string())
}

fn is_not_found(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_trimmed_key_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth_key");
        std::fs::write(&path, "secret-key\n").unwrap();

        let creds = Credentials::new(&path);
        assert_eq!(creds.load().unwrap(), "secret-key");
    }
}
