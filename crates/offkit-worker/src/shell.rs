//! App-shell manifest.
//!
//! The fixed list of URLs that must survive offline. Entries come in two
//! flavors: version-tagged (style/script/manifest, cache-busted per deploy
//! with a `v` query parameter) and untagged (images, robots, sitemap).
//! Relative entries resolve against the worker's registration scope.

use offkit_cache::CacheVersion;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Errors resolving a shell manifest.
#[derive(Error, Debug)]
pub enum ShellError {
    #[error("Invalid shell URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Declarative shell manifest, as carried by a worker blueprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppShellSpec {
    /// Document served for offline navigations.
    pub root_document: String,

    /// Dedicated offline page, tried after the root document.
    #[serde(default)]
    pub offline_page: Option<String>,

    /// Cache-busted entries; each gets a `v=<version>` query parameter.
    #[serde(default)]
    pub versioned: Vec<String>,

    /// Entries cached under their plain URL.
    #[serde(default)]
    pub unversioned: Vec<String>,
}

impl AppShellSpec {
    /// The canonical portfolio-site shell.
    pub fn site_default() -> Self {
        Self {
            root_document: "./index.html".to_string(),
            offline_page: Some("./404.html".to_string()),
            versioned: vec![
                "./styles.css".to_string(),
                "./script.js".to_string(),
                "./manifest.webmanifest".to_string(),
            ],
            unversioned: vec![
                "./".to_string(),
                "./robots.txt".to_string(),
                "./sitemap.xml".to_string(),
                "./assets/favicon.svg".to_string(),
                "./assets/images/og-image.jpg".to_string(),
                "./assets/images/profile.jpg".to_string(),
                "./assets/images/profile@2x.jpg".to_string(),
            ],
        }
    }
}

/// A shell manifest resolved against a scope, ready to precache.
#[derive(Debug, Clone)]
pub struct AppShell {
    root_document: Url,
    offline_page: Option<Url>,
    urls: Vec<Url>,
}

impl AppShell {
    /// Resolve a spec against the registration scope for one version.
    pub fn resolve(
        spec: &AppShellSpec,
        scope: &Url,
        version: &CacheVersion,
    ) -> Result<Self, ShellError> {
        let root_document = join(scope, &spec.root_document)?;
        let offline_page = spec
            .offline_page
            .as_deref()
            .map(|p| join(scope, p))
            .transpose()?;

        let mut urls: Vec<Url> = Vec::new();
        let mut push = |url: Url| {
            if !urls.contains(&url) {
                urls.push(url);
            }
        };

        push(root_document.clone());
        if let Some(page) = &offline_page {
            push(page.clone());
        }
        for entry in &spec.unversioned {
            push(join(scope, entry)?);
        }
        for entry in &spec.versioned {
            push(tag_version(join(scope, entry)?, version));
        }

        Ok(Self {
            root_document,
            offline_page,
            urls,
        })
    }

    /// The offline navigation fallback document.
    pub fn root_document(&self) -> &Url {
        &self.root_document
    }

    /// The dedicated offline page, when the shell carries one.
    pub fn offline_page(&self) -> Option<&Url> {
        self.offline_page.as_ref()
    }

    /// Everything to precache, in manifest order.
    pub fn urls(&self) -> &[Url] {
        &self.urls
    }
}

fn join(scope: &Url, entry: &str) -> Result<Url, ShellError> {
    scope.join(entry).map_err(|source| ShellError::InvalidUrl {
        url: entry.to_string(),
        source,
    })
}

/// Set (replacing, not appending) the `v` query parameter.
fn tag_version(url: Url, version: &CacheVersion) -> Url {
    let mut tagged = url.clone();
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "v")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    tagged.set_query(None);
    {
        let mut pairs = tagged.query_pairs_mut();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        pairs.append_pair("v", version.as_str());
    }
    tagged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Url {
        Url::parse("https://example.com/").unwrap()
    }

    #[test]
    fn test_resolve_site_default() {
        let shell =
            AppShell::resolve(&AppShellSpec::site_default(), &scope(), &"1".into()).unwrap();

        assert_eq!(
            shell.root_document().as_str(),
            "https://example.com/index.html"
        );
        assert_eq!(
            shell.offline_page().unwrap().as_str(),
            "https://example.com/404.html"
        );

        let urls: Vec<&str> = shell.urls().iter().map(|u| u.as_str()).collect();
        assert!(urls.contains(&"https://example.com/"));
        assert!(urls.contains(&"https://example.com/styles.css?v=1"));
        assert!(urls.contains(&"https://example.com/robots.txt"));
        assert!(urls.contains(&"https://example.com/assets/favicon.svg"));
    }

    #[test]
    fn test_versioned_entries_carry_version_tag() {
        let spec = AppShellSpec {
            root_document: "./index.html".to_string(),
            offline_page: None,
            versioned: vec!["./styles.css".to_string()],
            unversioned: vec![],
        };
        let shell = AppShell::resolve(&spec, &scope(), &"20260101r1".into()).unwrap();
        let urls: Vec<&str> = shell.urls().iter().map(|u| u.as_str()).collect();
        assert!(urls.contains(&"https://example.com/styles.css?v=20260101r1"));
    }

    #[test]
    fn test_version_tag_replaces_existing() {
        let url = Url::parse("https://example.com/styles.css?v=old&theme=dark").unwrap();
        let tagged = tag_version(url, &"new".into());
        assert_eq!(
            tagged.as_str(),
            "https://example.com/styles.css?theme=dark&v=new"
        );
    }

    #[test]
    fn test_duplicate_entries_collapse() {
        let spec = AppShellSpec {
            root_document: "./index.html".to_string(),
            offline_page: Some("./index.html".to_string()),
            versioned: vec![],
            unversioned: vec!["./index.html".to_string(), "./".to_string()],
        };
        let shell = AppShell::resolve(&spec, &scope(), &"1".into()).unwrap();
        let index_count = shell
            .urls()
            .iter()
            .filter(|u| u.as_str() == "https://example.com/index.html")
            .count();
        assert_eq!(index_count, 1);
    }

    #[test]
    fn test_scoped_resolution() {
        let scope = Url::parse("https://example.com/app/").unwrap();
        let spec = AppShellSpec {
            root_document: "./index.html".to_string(),
            offline_page: None,
            versioned: vec![],
            unversioned: vec![],
        };
        let shell = AppShell::resolve(&spec, &scope, &"1".into()).unwrap();
        assert_eq!(
            shell.root_document().as_str(),
            "https://example.com/app/index.html"
        );
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: AppShellSpec =
            serde_json::from_str(r#"{"root_document": "./index.html"}"#).unwrap();
        assert!(spec.offline_page.is_none());
        assert!(spec.versioned.is_empty());
        assert!(spec.unversioned.is_empty());
    }
}
