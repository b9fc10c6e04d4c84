use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Holds the ordered list of mirror roots serving the same input data and a
/// round-robin counter. The counter lives on the balancer itself -- not on
/// any individual [`LoadBalancedUrl`] -- so that rotation is shared across
/// every URL derived from it.
#[derive(Debug)]
pub struct LoadBalancer {
    mirrors: Vec<String>,
    counter: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(mirrors: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            mirrors,
            counter: AtomicUsize::new(0),
        })
    }

    /// Returns the next mirror in round-robin order, or `None` if the
    /// balancer has no mirrors configured.
    pub fn next(&self) -> Option<&str> {
        if self.mirrors.is_empty() {
            return None;
        }
        let i = self.counter.fetch_add(1, Ordering::SeqCst) % self.mirrors.len();
        Some(self.mirrors[i].as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }
}

/// A URL that is either served directly (`file://`, or no mirrors
/// configured) or resolved against one of a [`LoadBalancer`]'s mirrors on
/// every call to [`LoadBalancedUrl::get`].
#[derive(Debug, Clone)]
pub struct LoadBalancedUrl {
    direct_url: String,
    path: String,
    balancer: Arc<LoadBalancer>,
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported scheme for URL {url:?} (mirrors: {mirrors:?})")]
pub struct UnsupportedSchemeError {
    pub url: String,
    pub mirrors: Vec<String>,
}

impl LoadBalancedUrl {
    /// Build a root load-balanced URL. `path` is resolved relative to the
    /// first mirror (if any) to determine the effective scheme. Fails if
    /// that scheme isn't `file`, `http`, or `https`.
    pub fn new(path: impl Into<String>, mirrors: Vec<String>) -> Result<Self, UnsupportedSchemeError> {
        let path = path.into();
        let direct_url = match mirrors.first() {
            Some(mirror) => join_url(mirror, &path),
            None => path.clone(),
        };

        let scheme = scheme_of(&direct_url);
        let balancer = match scheme {
            "http" | "https" => LoadBalancer::new(mirrors),
            "file" => LoadBalancer::new(Vec::new()),
            _ => {
                return Err(UnsupportedSchemeError {
                    url: direct_url,
                    mirrors,
                })
            }
        };

        Ok(Self {
            direct_url,
            path,
            balancer,
        })
    }

    /// Derive a child URL whose path is `join(self.path, relative)`, sharing
    /// this URL's balancer so that rotation stays dataset-wide.
    pub fn join(&self, relative: impl AsRef<str>) -> Self {
        let path = join_path(&self.path, relative.as_ref());
        let direct_url = match self.balancer.next_preview() {
            Some(mirror) => join_url(mirror, &path),
            None => path.clone(),
        };
        Self {
            direct_url,
            path,
            balancer: self.balancer.clone(),
        }
    }

    /// Resolve this URL: the next mirror plus `path` if a mirror is
    /// available, else the direct URL.
    pub fn get(&self) -> String {
        match self.balancer.next() {
            Some(mirror) => join_url(mirror, &self.path),
            None => self.direct_url.clone(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }
}

impl LoadBalancer {
    /// Peek the first configured mirror without advancing the counter, used
    /// only to compute a child's `direct_url` fallback at construction time.
    fn next_preview(&self) -> Option<&str> {
        self.mirrors.first().map(|s| s.as_str())
    }
}

fn scheme_of(url: &str) -> &str {
    match url.split_once("://") {
        Some((scheme, _)) => scheme,
        None => "file",
    }
}

/// Resolve `path` against `root`, mimicking RFC 3986 reference resolution:
/// an absolute reference (one that already carries its own scheme, e.g.
/// `file:///data/x`) overrides the base entirely.
fn join_url(root: &str, path: &str) -> String {
    if path.contains("://") {
        return path.to_string();
    }
    format!("{}/{}", root.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn join_path(parent: &str, relative: &str) -> String {
    format!(
        "{}/{}",
        parent.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_round_robin_mod_n() {
        let balancer = LoadBalancer::new(vec![
            "https://m1".into(),
            "https://m2".into(),
            "https://m3".into(),
        ]);
        let got: Vec<_> = (0..7).map(|_| balancer.next().unwrap().to_string()).collect();
        assert_eq!(
            got,
            vec!["https://m1", "https://m2", "https://m3", "https://m1", "https://m2", "https://m3", "https://m1"]
        );
    }

    #[test]
    fn empty_mirrors_returns_none() {
        let balancer = LoadBalancer::new(Vec::new());
        assert!(balancer.next().is_none());
    }

    #[test]
    fn falls_back_to_direct_url_without_mirrors() {
        let url = LoadBalancedUrl::new("data/logs.tsv", Vec::new()).unwrap();
        assert_eq!(url.get(), "data/logs.tsv");
    }

    #[test]
    fn uses_mirrors_for_http_scheme() {
        let url = LoadBalancedUrl::new("logs.tsv", vec!["https://m1".into()]).unwrap();
        assert_eq!(url.get(), "https://m1/logs.tsv");
    }

    #[test]
    fn file_scheme_ignores_mirrors() {
        let url = LoadBalancedUrl::new("file:///data/logs.tsv", vec!["https://m1".into()]).unwrap();
        // mirrors are discarded because the resolved direct_url has scheme "file"
        assert!(url.balancer().is_empty());
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let err = LoadBalancedUrl::new("ftp://host/data", Vec::new()).unwrap_err();
        assert_eq!(err.url, "ftp://host/data");
    }

    #[test]
    fn child_shares_parent_balancer() {
        let parent = LoadBalancedUrl::new("root", vec!["https://m1".into(), "https://m2".into()]).unwrap();
        let child_a = parent.join("a.txt");
        let child_b = parent.join("b.txt");
        // Advance through the shared balancer via child_a, then child_b should see the next mirror.
        assert_eq!(child_a.get(), "https://m1/root/a.txt");
        assert_eq!(child_b.get(), "https://m2/root/b.txt");
    }
}
