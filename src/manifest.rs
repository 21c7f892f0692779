//! Period manifest: which archives a release publishes.
//!
//! The Receita Federal publishes one directory per release at
//! `{base_url}/{YYYY-MM}/`. Its index page links every `.zip` archive; the
//! [`ManifestResolver`] scrapes those links into [`FileDescriptor`]s, sorted by
//! name and de-duplicated.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::Period;
use crate::download::HttpClient;

#[allow(clippy::expect_used)]
static ANCHOR_ZIP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href\s*=\s*["']?([^"'\s>]+\.zip)["'\s>]"#).expect("valid anchor regex")
});

#[allow(clippy::expect_used)]
static BARE_ZIP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([A-Za-z0-9_.\-]+\.zip)\b").expect("valid bare token regex")
});

/// Manifest resolution errors. Fatal for the run.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The index page could not be fetched or listed no archives.
    #[error("manifest unavailable for period {period} at {url}: {reason}")]
    Unavailable {
        /// Requested period.
        period: String,
        /// Index URL.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// The configured base URL cannot be parsed.
    #[error("invalid base URL '{url}'")]
    InvalidBaseUrl {
        /// Rejected URL.
        url: String,
    },
}

/// Whether a file is an archive to extract or a data file loaded as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Archive,
    Data,
}

/// Dataset family an archive feeds, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatasetGroup {
    Empresas,
    Estabelecimentos,
    Socios,
    Simples,
    Cnaes,
    Motivos,
    Municipios,
    Naturezas,
    Paises,
    Qualificacoes,
    /// Name matched no known family; downloaded but feeds no table.
    Unknown,
}

impl DatasetGroup {
    const PREFIXES: [(&'static str, Self); 10] = [
        ("empresas", Self::Empresas),
        ("estabelecimentos", Self::Estabelecimentos),
        ("socios", Self::Socios),
        ("simples", Self::Simples),
        ("cnaes", Self::Cnaes),
        ("motivos", Self::Motivos),
        ("municipios", Self::Municipios),
        ("naturezas", Self::Naturezas),
        ("paises", Self::Paises),
        ("qualificacoes", Self::Qualificacoes),
    ];

    /// Classifies an archive file name, e.g. `Estabelecimentos3.zip`.
    #[must_use]
    pub fn from_file_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        Self::PREFIXES
            .iter()
            .find(|(prefix, _)| lower.starts_with(prefix))
            .map_or(Self::Unknown, |(_, group)| *group)
    }
}

impl fmt::Display for DatasetGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle of a file within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Downloaded,
    Validated,
    Extracted,
    Loaded,
    Failed,
    /// Failed validation twice; skipped by later stages.
    Excluded,
}

impl FileStatus {
    /// Every status, in pipeline order.
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Downloaded,
        Self::Validated,
        Self::Extracted,
        Self::Loaded,
        Self::Failed,
        Self::Excluded,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloaded => "downloaded",
            Self::Validated => "validated",
            Self::Extracted => "extracted",
            Self::Loaded => "loaded",
            Self::Failed => "failed",
            Self::Excluded => "excluded",
        }
    }
}

/// One expected remote file of a period.
///
/// Identity is `(logical_name, period)`. Only `status` changes after
/// resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub logical_name: String,
    pub remote_url: String,
    pub destination_path: PathBuf,
    pub expected_kind: FileKind,
    pub status: FileStatus,
    pub expected_size: Option<u64>,
    /// Lowercase hex SHA-256, when the publisher provides one.
    pub expected_sha256: Option<String>,
    pub dataset: DatasetGroup,
}

impl FileDescriptor {
    /// Creates a pending descriptor staged at `staging_dir/logical_name`.
    #[must_use]
    pub fn new(
        logical_name: impl Into<String>,
        remote_url: impl Into<String>,
        staging_dir: &Path,
    ) -> Self {
        let logical_name = logical_name.into();
        let expected_kind = if logical_name.to_ascii_lowercase().ends_with(".zip") {
            FileKind::Archive
        } else {
            FileKind::Data
        };
        Self {
            destination_path: staging_dir.join(&logical_name),
            dataset: DatasetGroup::from_file_name(&logical_name),
            remote_url: remote_url.into(),
            expected_kind,
            status: FileStatus::Pending,
            expected_size: None,
            expected_sha256: None,
            logical_name,
        }
    }

    #[must_use]
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_expected_sha256(mut self, digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(digest.into().to_ascii_lowercase());
        self
    }
}

/// Resolves a period into its list of archives.
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    client: HttpClient,
    base_url: String,
    staging_path: PathBuf,
}

impl ManifestResolver {
    #[must_use]
    pub fn new(client: HttpClient, base_url: impl Into<String>, staging_path: &Path) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            staging_path: staging_path.to_path_buf(),
        }
    }

    /// Index URL of a period, with a trailing slash.
    #[must_use]
    pub fn index_url(&self, period: Period) -> String {
        format!("{}/{}/", self.base_url.trim_end_matches('/'), period)
    }

    /// Fetches the period index and lists its archives.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Unavailable`] when the index cannot be fetched
    /// or links no archive, and [`ManifestError::InvalidBaseUrl`] when the
    /// base URL does not parse.
    #[instrument(skip(self), fields(period = %period))]
    pub async fn resolve(&self, period: Period) -> Result<Vec<FileDescriptor>, ManifestError> {
        let url = self.index_url(period);
        let index = Url::parse(&url).map_err(|_| ManifestError::InvalidBaseUrl {
            url: self.base_url.clone(),
        })?;

        let body = self.client.get_text(&url).await.map_err(|e| {
            warn!(error = %e, "index request failed");
            ManifestError::Unavailable {
                period: period.key(),
                url: url.clone(),
                reason: e.to_string(),
            }
        })?;

        let files = parse_index(&body, &index, &self.staging_path);
        if files.is_empty() {
            return Err(ManifestError::Unavailable {
                period: period.key(),
                url,
                reason: "index lists no .zip archives".to_string(),
            });
        }

        let unknown = files
            .iter()
            .filter(|f| f.dataset == DatasetGroup::Unknown)
            .count();
        info!(files = files.len(), unknown, "manifest resolved");
        Ok(files)
    }
}

/// Extracts archive descriptors from an index page.
///
/// Anchors whose `href` ends in `.zip` are used first; when none exist the
/// page is scanned for bare `*.zip` tokens. The file name is the last path
/// segment; the result is sorted by name with duplicates removed.
#[must_use]
pub fn parse_index(html: &str, index_url: &Url, staging_path: &Path) -> Vec<FileDescriptor> {
    let mut found: BTreeMap<String, String> = BTreeMap::new();

    for capture in ANCHOR_ZIP.captures_iter(html) {
        let href = &capture[1];
        let Some(name) = last_segment(href) else {
            continue;
        };
        let remote = index_url
            .join(href)
            .map_or_else(|_| format!("{index_url}{name}"), String::from);
        found.entry(name).or_insert(remote);
    }

    if found.is_empty() {
        debug!("no archive anchors found, scanning for bare names");
        for capture in BARE_ZIP.captures_iter(html) {
            let Some(name) = last_segment(&capture[1]) else {
                continue;
            };
            let remote = index_url
                .join(&name)
                .map_or_else(|_| format!("{index_url}{name}"), String::from);
            found.entry(name).or_insert(remote);
        }
    }

    found
        .into_iter()
        .map(|(name, remote)| FileDescriptor::new(name, remote, staging_path))
        .collect()
}

fn last_segment(href: &str) -> Option<String> {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    let name = path.rsplit('/').next().unwrap_or(path).trim();
    let valid = !name.is_empty()
        && name.to_ascii_lowercase().ends_with(".zip")
        && !name.starts_with('<')
        && !name.starts_with('.');
    valid.then(|| name.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    const INDEX: &str = r#"<html><body><table>
        <tr><td><a href="Cnaes.zip">Cnaes.zip</a></td><td>2025-08-10 22:10</td></tr>
        <tr><td><a href="Empresas1.zip">Empresas1.zip</a></td></tr>
        <tr><td><a href="Empresas0.zip">Empresas0.zip</a></td></tr>
        <tr><td><a href="/dados/cnpj/2025-08/Empresas0.zip">dup</a></td></tr>
        <tr><td><a href="https://mirror.example/x/Socios0.zip">Socios0.zip</a></td></tr>
        <tr><td><a href="LEIAME.pdf">LEIAME.pdf</a></td></tr>
        <tr><td><a href="Layout2025.zip">layout</a></td></tr>
    </table></body></html>"#;

    fn index() -> Url {
        Url::parse("https://arquivos.example/dados/cnpj/2025-08/").unwrap()
    }

    #[test]
    fn test_parse_index_sorts_and_dedups_anchor_links() {
        let files = parse_index(INDEX, &index(), Path::new("/staging"));
        let names: Vec<_> = files.iter().map(|f| f.logical_name.as_str()).collect();
        assert_eq!(
            names,
            [
                "Cnaes.zip",
                "Empresas0.zip",
                "Empresas1.zip",
                "Layout2025.zip",
                "Socios0.zip"
            ]
        );
    }

    #[test]
    fn test_parse_index_resolves_relative_and_absolute_urls() {
        let files = parse_index(INDEX, &index(), Path::new("/staging"));
        assert_eq!(
            files[0].remote_url,
            "https://arquivos.example/dados/cnpj/2025-08/Cnaes.zip"
        );
        let socios = files.iter().find(|f| f.logical_name == "Socios0.zip").unwrap();
        assert_eq!(socios.remote_url, "https://mirror.example/x/Socios0.zip");
        assert_eq!(socios.destination_path, Path::new("/staging/Socios0.zip"));
    }

    #[test]
    fn test_parse_index_classifies_groups() {
        let files = parse_index(INDEX, &index(), Path::new("/staging"));
        assert_eq!(files[0].dataset, DatasetGroup::Cnaes);
        assert_eq!(files[1].dataset, DatasetGroup::Empresas);
        assert_eq!(files[3].dataset, DatasetGroup::Unknown);
        assert!(files.iter().all(|f| f.expected_kind == FileKind::Archive));
        assert!(files.iter().all(|f| f.status == FileStatus::Pending));
    }

    #[test]
    fn test_parse_index_falls_back_to_bare_names() {
        let html = "Arquivos: Motivos.zip, Paises.zip e Motivos.zip";
        let files = parse_index(html, &index(), Path::new("/staging"));
        let names: Vec<_> = files.iter().map(|f| f.logical_name.as_str()).collect();
        assert_eq!(names, ["Motivos.zip", "Paises.zip"]);
        assert_eq!(
            files[0].remote_url,
            "https://arquivos.example/dados/cnpj/2025-08/Motivos.zip"
        );
    }

    #[test]
    fn test_parse_index_without_archives_is_empty() {
        assert!(parse_index("<html>nada</html>", &index(), Path::new("/s")).is_empty());
    }

    #[tokio::test]
    async fn test_resolve_fetches_period_index() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/dados/2025-08/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INDEX))
            .mount(&mock_server)
            .await;

        let resolver = ManifestResolver::new(
            HttpClient::new(Duration::from_secs(5)),
            format!("{}/dados", mock_server.uri()),
            Path::new("/staging"),
        );
        let files = resolver.resolve(Period::new(2025, 8).unwrap()).await.unwrap();
        assert_eq!(files.len(), 5);
        assert!(files[0].remote_url.starts_with(&mock_server.uri()));
    }

    #[tokio::test]
    async fn test_resolve_missing_period_is_unavailable() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let resolver = ManifestResolver::new(
            HttpClient::new(Duration::from_secs(5)),
            mock_server.uri(),
            Path::new("/staging"),
        );
        let err = resolver
            .resolve(Period::new(2031, 1).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::Unavailable { .. }));
        assert!(err.to_string().contains("2031-01"));
    }

    #[tokio::test]
    async fn test_resolve_empty_index_is_unavailable() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&mock_server)
            .await;

        let resolver = ManifestResolver::new(
            HttpClient::new(Duration::from_secs(5)),
            mock_server.uri(),
            Path::new("/staging"),
        );
        assert!(matches!(
            resolver.resolve(Period::new(2025, 8).unwrap()).await,
            Err(ManifestError::Unavailable { .. })
        ));
    }
}
