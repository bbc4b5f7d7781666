//! GitHub Releases upstream.
//!
//! OpenTofu publishes its binaries as release assets instead of a
//! `releases.hashicorp.com`-style index:
//!
//! ```text
//! {api}/repos/{owner}/{repo}/releases?per_page=100&page={n}
//!   {prefix}_{version}_{os}_{arch}.zip
//!   {prefix}_{version}_SHA256SUMS
//!   {prefix}_{version}_SHA256SUMS{signature_suffix}   (or any *.sig variant)
//! ```
//!
//! Upstream URLs may name the repository page (`https://github.com/o/r`,
//! optionally with `/releases`) or the API endpoint
//! (`https://api.github.com/repos/o/r`).

use chrono::{DateTime, Utc};
use reqwest::Url;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{HttpClients, ReleaseBuild, ReleaseError, ReleaseVersion, cancellable};

/// Public GitHub API root.
pub const GITHUB_API_URL: &str = "https://api.github.com";
/// Releases requested per API page.
pub const PAGE_SIZE: usize = 100;
const MAX_PAGES: u32 = 50;
const API_VERSION: &str = "2022-11-28";

/// API root and optional token for GitHub upstreams.
#[derive(Debug, Clone)]
pub struct GitHubOptions {
    /// API root, `https://api.github.com` unless pointed at a GitHub Enterprise host.
    pub api_url: String,
    /// Bearer token; unauthenticated clients get 60 requests an hour.
    pub token: Option<String>,
}

impl Default for GitHubOptions {
    fn default() -> Self {
        Self {
            api_url: GITHUB_API_URL.to_string(),
            token: None,
        }
    }
}

/// Whether an upstream URL points at github.com rather than a release index.
pub fn is_github_url(upstream_url: &str) -> bool {
    Url::parse(upstream_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .is_some_and(|host| {
            matches!(host.as_str(), "github.com" | "www.github.com" | "api.github.com")
        })
}

/// Asset file prefix for a product. OpenTofu ships `tofu_*` archives.
pub fn asset_prefix(product: &str) -> String {
    if product.eq_ignore_ascii_case("opentofu") {
        "tofu".to_string()
    } else {
        product.to_string()
    }
}

/// A repository whose releases carry the binaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubRepo {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Asset file prefix, see [`asset_prefix`].
    pub asset_prefix: String,
    /// Preferred signature asset suffix.
    pub signature_suffix: String,
}

impl GitHubRepo {
    /// Extract owner and repository from a GitHub URL.
    ///
    /// # Errors
    ///
    /// [`ReleaseError::InvalidUpstream`] when no owner/repo pair can be found.
    pub fn parse(
        upstream_url: &str,
        product: &str,
        signature_suffix: &str,
    ) -> Result<Self, ReleaseError> {
        let invalid = || {
            ReleaseError::InvalidUpstream(format!(
                "cannot parse GitHub owner/repo from {upstream_url:?}"
            ))
        };
        let url = Url::parse(upstream_url).map_err(|_| invalid())?;
        let host = url.host_str().map(str::to_ascii_lowercase).unwrap_or_default();
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();
        let path = match (host.as_str(), segments.split_first()) {
            ("api.github.com", Some((&"repos", rest))) => rest,
            ("api.github.com", _) => return Err(invalid()),
            _ => segments.as_slice(),
        };
        let [owner, repo, ..] = path else {
            return Err(invalid());
        };
        let repo = repo.strip_suffix(".git").unwrap_or(*repo);
        if repo.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            owner: (*owner).to_string(),
            repo: repo.to_string(),
            asset_prefix: asset_prefix(product),
            signature_suffix: signature_suffix.to_string(),
        })
    }

    /// Convert one release into a version; `None` when it has no matching binaries.
    fn to_release_version(&self, release: GitHubRelease) -> Option<ReleaseVersion> {
        let tag = release.tag_name.trim();
        let version = tag.strip_prefix('v').unwrap_or(tag).to_string();
        if version.is_empty() {
            return None;
        }

        let preferred_signature = format!(
            "{}_{version}_SHA256SUMS{}",
            self.asset_prefix, self.signature_suffix
        );
        let mut builds = Vec::new();
        let mut shasums_url = None;
        let mut signature_url: Option<String> = None;
        for asset in release.assets {
            let Some(kind) = classify(&asset.name) else {
                continue;
            };
            if !kind.prefix().eq_ignore_ascii_case(&self.asset_prefix) {
                continue;
            }
            match kind {
                AssetKind::Binary { os, arch, .. } => builds.push(ReleaseBuild {
                    os: os.to_string(),
                    arch: arch.to_string(),
                    filename: asset.name.clone(),
                    url: asset.browser_download_url,
                }),
                AssetKind::Checksums { .. } => shasums_url = Some(asset.browser_download_url),
                AssetKind::Signature { .. } => {
                    if asset.name == preferred_signature || signature_url.is_none() {
                        signature_url = Some(asset.browser_download_url);
                    }
                }
            }
        }
        if builds.is_empty() {
            return None;
        }

        let release_date = release
            .published_at
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Some(ReleaseVersion {
            version,
            shasums_url,
            signature_url,
            release_date,
            builds,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, PartialEq, Eq)]
enum AssetKind<'a> {
    Binary {
        prefix: &'a str,
        os: &'a str,
        arch: &'a str,
    },
    Checksums {
        prefix: &'a str,
    },
    Signature {
        prefix: &'a str,
    },
}

impl<'a> AssetKind<'a> {
    fn prefix(&self) -> &'a str {
        match self {
            Self::Binary { prefix, .. }
            | Self::Checksums { prefix }
            | Self::Signature { prefix } => *prefix,
        }
    }
}

/// Split `{prefix}_{version}` where the version holds no underscore.
fn prefix_of(stem: &str) -> Option<&str> {
    let (prefix, version) = stem.rsplit_once('_')?;
    (!prefix.is_empty() && !version.is_empty()).then_some(prefix)
}

fn classify(name: &str) -> Option<AssetKind<'_>> {
    if let Some(stem) = name.strip_suffix(".zip") {
        let mut parts = stem.rsplitn(3, '_');
        let arch = parts.next()?;
        let os = parts.next()?;
        let prefix = prefix_of(parts.next()?)?;
        if arch.is_empty() || os.is_empty() {
            return None;
        }
        return Some(AssetKind::Binary { prefix, os, arch });
    }
    if let Some(stem) = name.strip_suffix("_SHA256SUMS") {
        return prefix_of(stem).map(|prefix| AssetKind::Checksums { prefix });
    }
    let (stem, rest) = name.split_once("_SHA256SUMS.")?;
    if rest.ends_with("sig") {
        return prefix_of(stem).map(|prefix| AssetKind::Signature { prefix });
    }
    None
}

/// Page through every non-draft release of `repo`.
pub(super) async fn list_releases(
    http: &HttpClients,
    repo: &GitHubRepo,
    cancel: &CancellationToken,
) -> Result<Vec<ReleaseVersion>, ReleaseError> {
    let url = format!(
        "{}/repos/{}/{}/releases",
        http.github.api_url.trim_end_matches('/'),
        repo.owner,
        repo.repo
    );
    let mut versions = Vec::new();
    let mut skipped = 0usize;

    for page in 1..=MAX_PAGES {
        let mut request = http
            .metadata
            .get(&url)
            .query(&[("per_page", PAGE_SIZE.to_string()), ("page", page.to_string())])
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(token) = &http.github.token {
            request = request.bearer_auth(token);
        }
        let resp = cancellable(cancel, request.send())
            .await??
            .error_for_status()?;
        let entries = cancellable(cancel, resp.json::<Vec<serde_json::Value>>()).await??;
        let count = entries.len();

        for entry in entries {
            match serde_json::from_value::<GitHubRelease>(entry) {
                Ok(release) if release.draft => {}
                Ok(release) => {
                    if let Some(version) = repo.to_release_version(release) {
                        versions.push(version);
                    }
                }
                Err(e) => {
                    debug!(page, error = %e, "malformed GitHub release entry");
                    skipped += 1;
                }
            }
        }

        if count < PAGE_SIZE {
            if skipped > 0 {
                warn!(url, skipped, "skipped malformed GitHub release entries");
            }
            return Ok(versions);
        }
    }

    warn!(url, pages = MAX_PAGES, "stopped paging GitHub releases at the page limit");
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::releases::HttpOptions;
    use mockito::{Matcher, Server};

    fn repo() -> GitHubRepo {
        GitHubRepo::parse("https://github.com/opentofu/opentofu", "opentofu", ".gpgsig").unwrap()
    }

    #[test]
    fn parses_repository_urls() {
        for url in [
            "https://github.com/opentofu/opentofu",
            "https://github.com/opentofu/opentofu/",
            "https://github.com/opentofu/opentofu/releases",
            "https://github.com/opentofu/opentofu.git",
            "https://api.github.com/repos/opentofu/opentofu/releases",
            "https://API.github.com/repos/opentofu/opentofu",
        ] {
            let parsed = GitHubRepo::parse(url, "opentofu", ".sig").unwrap();
            assert_eq!((parsed.owner.as_str(), parsed.repo.as_str()), ("opentofu", "opentofu"), "{url}");
            assert_eq!(parsed.asset_prefix, "tofu");
        }

        for url in [
            "https://github.com/opentofu",
            "https://api.github.com/opentofu/opentofu",
            "not a url",
        ] {
            assert!(matches!(
                GitHubRepo::parse(url, "opentofu", ".sig"),
                Err(ReleaseError::InvalidUpstream(_))
            ));
        }
    }

    #[test]
    fn detects_github_hosts() {
        assert!(is_github_url("https://github.com/opentofu/opentofu"));
        assert!(is_github_url("https://api.github.com/repos/o/r"));
        assert!(!is_github_url("https://releases.hashicorp.com"));
        assert!(!is_github_url("https://github.com.evil.example/o/r"));
        assert_eq!(asset_prefix("OpenTofu"), "tofu");
        assert_eq!(asset_prefix("terraform"), "terraform");
    }

    #[test]
    fn classifies_release_assets() {
        assert_eq!(
            classify("tofu_1.9.0_linux_amd64.zip"),
            Some(AssetKind::Binary {
                prefix: "tofu",
                os: "linux",
                arch: "amd64"
            })
        );
        assert_eq!(
            classify("my_tool_1.0.0_darwin_arm64.zip"),
            Some(AssetKind::Binary {
                prefix: "my_tool",
                os: "darwin",
                arch: "arm64"
            })
        );
        assert_eq!(
            classify("tofu_1.9.0_SHA256SUMS"),
            Some(AssetKind::Checksums { prefix: "tofu" })
        );
        assert_eq!(
            classify("tofu_1.9.0_SHA256SUMS.gpgsig"),
            Some(AssetKind::Signature { prefix: "tofu" })
        );
        assert_eq!(
            classify("terraform_1.9.0_SHA256SUMS.72D7468F.sig"),
            Some(AssetKind::Signature { prefix: "terraform" })
        );
        assert_eq!(classify("tofu_1.9.0_SHA256SUMS.pem"), None);
        assert_eq!(classify("tofu_1.9.0_linux_amd64.tar.gz"), None);
        assert_eq!(classify("linux_amd64.zip"), None);
    }

    fn release_json(tag: &str, assets: &[&str]) -> serde_json::Value {
        let assets: Vec<_> = assets
            .iter()
            .map(|name| {
                serde_json::json!({
                    "name": name,
                    "browser_download_url": format!("https://github.com/opentofu/opentofu/releases/download/{tag}/{name}"),
                })
            })
            .collect();
        serde_json::json!({
            "tag_name": tag,
            "draft": false,
            "prerelease": false,
            "published_at": "2024-12-10T09:00:00Z",
            "assets": assets,
        })
    }

    #[test]
    fn release_conversion_matches_prefix_and_prefers_configured_signature() {
        let release: GitHubRelease = serde_json::from_value(release_json(
            "v1.9.0",
            &[
                "tofu_1.9.0_linux_amd64.zip",
                "tofu_1.9.0_darwin_arm64.zip",
                "terraform_1.9.0_linux_amd64.zip",
                "tofu_1.9.0_SHA256SUMS",
                "tofu_1.9.0_SHA256SUMS.sig",
                "tofu_1.9.0_SHA256SUMS.gpgsig",
                "tofu_1.9.0_SHA256SUMS.pem",
            ],
        ))
        .unwrap();
        let version = repo().to_release_version(release).unwrap();

        assert_eq!(version.version, "1.9.0");
        assert_eq!(version.builds.len(), 2);
        assert!(version.builds.iter().all(|b| b.filename.starts_with("tofu_")));
        assert!(version.shasums_url.as_deref().unwrap().ends_with("/tofu_1.9.0_SHA256SUMS"));
        assert!(
            version
                .signature_url
                .as_deref()
                .unwrap()
                .ends_with("/tofu_1.9.0_SHA256SUMS.gpgsig")
        );
        assert!(version.release_date.is_some());
    }

    #[test]
    fn release_without_binaries_is_dropped() {
        let release: GitHubRelease =
            serde_json::from_value(release_json("v1.9.0", &["tofu_1.9.0_SHA256SUMS"])).unwrap();
        assert!(repo().to_release_version(release).is_none());
    }

    fn clients(api: &str) -> HttpClients {
        HttpClients::new(&HttpOptions::default())
            .unwrap()
            .with_github(GitHubOptions {
                api_url: api.to_string(),
                token: Some("test-token".into()),
            })
    }

    #[tokio::test]
    async fn list_releases_follows_pages_and_skips_drafts() {
        let mut server = Server::new_async().await;

        let mut first: Vec<serde_json::Value> = (0..PAGE_SIZE - 1)
            .map(|i| {
                let asset = format!("tofu_1.{i}.0_linux_amd64.zip");
                release_json(&format!("v1.{i}.0"), &[asset.as_str()])
            })
            .collect();
        let mut draft = release_json("v2.0.0", &["tofu_2.0.0_linux_amd64.zip"]);
        draft["draft"] = serde_json::Value::Bool(true);
        first.push(draft);
        let second = vec![
            release_json("v0.9.0", &["tofu_0.9.0_linux_amd64.zip", "tofu_0.9.0_SHA256SUMS"]),
            serde_json::json!({"tag_name": 42}),
        ];

        let page_one = server
            .mock("GET", "/repos/opentofu/opentofu/releases")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("per_page".into(), "100".into()),
                Matcher::UrlEncoded("page".into(), "1".into()),
            ]))
            .match_header("authorization", "Bearer test-token")
            .match_header("accept", "application/vnd.github+json")
            .with_status(200)
            .with_body(serde_json::Value::Array(first).to_string())
            .create_async()
            .await;
        let page_two = server
            .mock("GET", "/repos/opentofu/opentofu/releases")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_status(200)
            .with_body(serde_json::Value::Array(second).to_string())
            .create_async()
            .await;

        let versions = list_releases(&clients(&server.url()), &repo(), &CancellationToken::new())
            .await
            .unwrap();
        page_one.assert_async().await;
        page_two.assert_async().await;

        assert_eq!(versions.len(), PAGE_SIZE);
        assert!(versions.iter().all(|v| v.version != "2.0.0"));
        let last = versions.iter().find(|v| v.version == "0.9.0").unwrap();
        assert!(last.shasums_url.is_some());
        assert!(last.signature_url.is_none());
    }

    #[tokio::test]
    async fn list_releases_surfaces_api_errors() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/repos/opentofu/opentofu/releases")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(r#"{"message": "API rate limit exceeded"}"#)
            .create_async()
            .await;
        let err = list_releases(&clients(&server.url()), &repo(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::Http(_)));
    }
}
