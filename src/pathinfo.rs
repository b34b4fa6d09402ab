//! Request path grammar and the on-storage layout.
//!
//! The storage layout below is the docker/distribution registry layout and
//! is shared with other consumers of the same bucket, so the paths are not
//! free to change.

use crate::config::V2_PREFIX;

/// What a `/v2/...` request is asking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `/manifests/{tag-or-digest}`
    Manifests(String),
    /// `/blobs/{sha256:hex}`
    Blobs(String),
    /// `/tags/list`
    TagsList,
}

/// Parsed form of `/v2/{host?}/{image...}/{manifests|blobs|tags}/{ref}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    /// Upstream registry domain. Empty until resolved when the path did not
    /// carry one.
    pub host: String,
    pub image: String,
    pub reference: Reference,
}

impl PathInfo {
    /// Parse a request path. The first segment after `/v2/` is treated as
    /// the upstream host only when it looks like a domain (contains a dot);
    /// otherwise the host is left empty for the caller to fill from the
    /// token attribute, per-request override, or configured default.
    ///
    /// A single-segment image for docker.io is NOT library/-prefixed here;
    /// that decision belongs to the policy layer via the registry record.
    pub fn parse(path: &str) -> Option<PathInfo> {
        let rest = path.strip_prefix(V2_PREFIX)?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() < 3 {
            return None;
        }

        let (reference, image_parts) = match (
            parts[parts.len() - 2],
            parts[parts.len() - 1],
        ) {
            ("manifests", reference) if !reference.is_empty() => (
                Reference::Manifests(reference.to_string()),
                &parts[..parts.len() - 2],
            ),
            ("blobs", digest) => {
                if parse_sha256(digest).is_none() {
                    return None;
                }
                (
                    Reference::Blobs(digest.to_string()),
                    &parts[..parts.len() - 2],
                )
            }
            ("tags", "list") => (Reference::TagsList, &parts[..parts.len() - 2]),
            _ => return None,
        };

        let (host, image_parts) = match image_parts.first() {
            Some(first) if first.contains('.') => (first.to_string(), &image_parts[1..]),
            _ => (String::new(), image_parts),
        };

        if image_parts.is_empty() || image_parts.iter().any(|p| p.is_empty()) {
            return None;
        }

        Some(PathInfo {
            host,
            image: image_parts.join("/"),
            reference,
        })
    }

    /// Path of the equivalent request at the origin (host stripped).
    pub fn upstream_path(&self) -> String {
        match &self.reference {
            Reference::Manifests(r) => format!("/v2/{}/manifests/{}", self.image, r),
            Reference::Blobs(d) => format!("/v2/{}/blobs/{}", self.image, d),
            Reference::TagsList => format!("/v2/{}/tags/list", self.image),
        }
    }

    /// Token scope covering this repository.
    pub fn scope(&self) -> String {
        if self.host.is_empty() {
            format!("repository:{}:pull", self.image)
        } else {
            format!("repository:{}/{}:pull", self.host, self.image)
        }
    }
}

/// Validate a `sha256:<hex64>` digest and return the hex part.
pub fn parse_sha256(digest: &str) -> Option<&str> {
    let hx = digest.strip_prefix("sha256:")?;
    if hx.len() != 64 || !hx.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(hx)
}

/// `…/repositories/{host}/{image}/_manifests/revisions/sha256/{hex}/link`
pub fn manifest_revision_link_path(host: &str, image: &str, hx: &str) -> String {
    format!(
        "/docker/registry/v2/repositories/{}/{}/_manifests/revisions/sha256/{}/link",
        host, image, hx
    )
}

/// `…/repositories/{host}/{image}/_manifests/tags/{tag}/current/link`
pub fn manifest_tag_link_path(host: &str, image: &str, tag: &str) -> String {
    format!(
        "/docker/registry/v2/repositories/{}/{}/_manifests/tags/{}/current/link",
        host, image, tag
    )
}

/// `…/blobs/sha256/{hex[0:2]}/{hex}/data`
pub fn blob_data_path(hx: &str) -> String {
    format!("/docker/registry/v2/blobs/sha256/{}/{}/data", &hx[..2], hx)
}

/// Rewrite an origin pagination `Link` header so the next-page URL points
/// back through the proxy: `</v2/image/tags/list>; ref=x` under host `h`
/// becomes `</v2/h/image/tags/list>; ref=x`. Absolute origin URLs are
/// flattened to the same relative form. All other link parameters are kept.
pub fn rewrite_pagination_link(old_link: &str, host: &str) -> String {
    let Some(open) = old_link.find('<') else {
        return old_link.to_string();
    };
    let Some(close) = old_link[open..].find('>').map(|i| open + i) else {
        return old_link.to_string();
    };

    let target = &old_link[open + 1..close];
    let path = match target.find("://") {
        // Absolute URL: keep only path and query.
        Some(scheme_end) => match target[scheme_end + 3..].find('/') {
            Some(slash) => &target[scheme_end + 3 + slash..],
            None => return old_link.to_string(),
        },
        None => target,
    };

    let Some(rest) = path.strip_prefix(V2_PREFIX) else {
        return old_link.to_string();
    };

    format!(
        "{}</v2/{}/{}>{}",
        &old_link[..open],
        host,
        rest,
        &old_link[close + 1..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_manifest_with_host() {
        let info = PathInfo::parse("/v2/docker.io/busybox/manifests/1").unwrap();
        assert_eq!(info.host, "docker.io");
        assert_eq!(info.image, "busybox");
        assert_eq!(info.reference, Reference::Manifests("1".to_string()));
    }

    #[test]
    fn parse_manifest_nested_image() {
        let info = PathInfo::parse("/v2/docker.io/library/busybox/manifests/1").unwrap();
        assert_eq!(info.host, "docker.io");
        assert_eq!(info.image, "library/busybox");
    }

    #[test]
    fn parse_without_host() {
        let info = PathInfo::parse("/v2/library/busybox/manifests/latest").unwrap();
        assert_eq!(info.host, "");
        assert_eq!(info.image, "library/busybox");
    }

    #[test]
    fn parse_blob_requires_sha256() {
        let digest = format!("sha256:{}", "ab".repeat(32));
        let info = PathInfo::parse(&format!("/v2/ghcr.io/a/b/blobs/{}", digest)).unwrap();
        assert_eq!(info.reference, Reference::Blobs(digest));

        assert!(PathInfo::parse("/v2/ghcr.io/a/b/blobs/md5:abcd").is_none());
        assert!(PathInfo::parse("/v2/ghcr.io/a/b/blobs/sha256:short").is_none());
    }

    #[test]
    fn parse_tags_list() {
        let info = PathInfo::parse("/v2/quay.io/coreos/etcd/tags/list").unwrap();
        assert_eq!(info.reference, Reference::TagsList);
        assert_eq!(info.image, "coreos/etcd");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(PathInfo::parse("/v2/").is_none());
        assert!(PathInfo::parse("/v2/manifests/x").is_none());
        assert!(PathInfo::parse("/v1/a/manifests/x").is_none());
        assert!(PathInfo::parse("/v2/docker.io/manifests/latest").is_none());
    }

    #[test]
    fn upstream_paths() {
        let info = PathInfo::parse("/v2/docker.io/library/busybox/manifests/1").unwrap();
        assert_eq!(info.upstream_path(), "/v2/library/busybox/manifests/1");
        assert_eq!(info.scope(), "repository:docker.io/library/busybox:pull");
    }

    #[test]
    fn storage_paths_are_bit_exact() {
        let hx = "d".repeat(64);
        assert_eq!(
            manifest_revision_link_path("docker.io", "library/busybox", &hx),
            format!(
                "/docker/registry/v2/repositories/docker.io/library/busybox/_manifests/revisions/sha256/{}/link",
                hx
            )
        );
        assert_eq!(
            manifest_tag_link_path("docker.io", "library/busybox", "1"),
            "/docker/registry/v2/repositories/docker.io/library/busybox/_manifests/tags/1/current/link"
        );
        assert_eq!(
            blob_data_path(&hx),
            format!("/docker/registry/v2/blobs/sha256/dd/{}/data", hx)
        );
    }

    #[test]
    fn pagination_rewrite_relative() {
        assert_eq!(
            rewrite_pagination_link("</v2/image/tags/list>; ref=other", "prefix"),
            "</v2/prefix/image/tags/list>; ref=other"
        );
    }

    #[test]
    fn pagination_rewrite_absolute() {
        assert_eq!(
            rewrite_pagination_link("<http://domain/v2/image/tags/list>; ref=other", "prefix"),
            "</v2/prefix/image/tags/list>; ref=other"
        );
    }

    #[test]
    fn pagination_rewrite_keeps_query_and_params() {
        assert_eq!(
            rewrite_pagination_link(
                "</v2/foo/tags/list?last=x&n=50>; rel=\"next\"",
                "docker.io"
            ),
            "</v2/docker.io/foo/tags/list?last=x&n=50>; rel=\"next\""
        );
    }
}
