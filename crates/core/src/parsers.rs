//! Image reference parsing.

const DEFAULT_IMAGE_TAG: &str = "latest";

/// Split a repository reference into `(repo, tag_or_digest)`. A tag may be
/// confused with a registry port (`localhost:5000/foo`), so a suffix after the
/// last `:` only counts as a tag when it holds no `/`.
fn parse_repository_tag(repos: &str) -> (&str, &str) {
    if let Some((repo, digest)) = repos.split_once('@') {
        return (repo, digest);
    }
    match repos.rfind(':') {
        Some(n) if !repos[n + 1..].contains('/') => (&repos[..n], &repos[n + 1..]),
        _ => (repos, ""),
    }
}

/// Parse an image string into repo and tag, defaulting the tag to `latest`.
pub fn parse_image_name(image: &str) -> (String, String) {
    let (repo, tag) = parse_repository_tag(image);
    let tag = if tag.is_empty() { DEFAULT_IMAGE_TAG } else { tag };
    (repo.to_string(), tag.to_string())
}
