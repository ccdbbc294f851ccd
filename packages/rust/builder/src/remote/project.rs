//! Build project naming and the buildspec template.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Longest project name the build service accepts.
pub const MAX_PROJECT_NAME_LEN: usize = 64;

/// Hex digits of the repository hash appended to truncated names.
const HASH_SUFFIX_LEN: usize = 8;

static INVALID_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("valid regex"));

/// Deterministic project name for `repository`.
///
/// `remind101/acme-inc` becomes `remind101-acme-inc`. Names longer than
/// [`MAX_PROJECT_NAME_LEN`] are cut short and suffixed with `-` and the first
/// 8 hex digits of the repository's SHA-256, so distinct long repositories
/// keep distinct names.
pub fn project_name(repository: &str) -> String {
    let slug = INVALID_CHARS.replace_all(repository, "-");
    if slug.len() <= MAX_PROJECT_NAME_LEN {
        return slug.into_owned();
    }

    let digest = Sha256::digest(repository.as_bytes());
    let hash: String = digest
        .iter()
        .take(HASH_SUFFIX_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect();
    // The slug is ASCII, so byte slicing is safe.
    let keep = MAX_PROJECT_NAME_LEN - HASH_SUFFIX_LEN - 1;
    format!("{}-{hash}", &slug[..keep])
}

/// Image repository images of `repository` are pushed to.
pub fn image_repository(prefix: Option<&str>, repository: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => {
            format!("{}/{repository}", prefix.trim_end_matches('/'))
        }
        _ => repository.to_string(),
    }
}

const BUILDSPEC_TEMPLATE: &str = r#"version: 0.2

env:
  variables:
    REPOSITORY: "{repository}"
    IMAGE: "{image}"
    SHA: "{sha}"
    BRANCH: "{branch}"
    NO_CACHE: "0"

phases:
  pre_build:
    commands:
      - |
        if [ -n "$DOCKER_CREDENTIALS" ]; then
          echo "$DOCKER_CREDENTIALS" > "$HOME/.dockercfg"
        fi
      - |
        if [ "$NO_CACHE" != "1" ]; then
          docker pull "$IMAGE:$BRANCH" || docker pull "$IMAGE:master" || docker pull "$IMAGE:latest" || true
        fi
  build:
    commands:
      - |
        if [ "$NO_CACHE" = "1" ]; then
          docker build --no-cache -t "$IMAGE:$SHA" .
        else
          docker build --cache-from "$IMAGE:$BRANCH" --cache-from "$IMAGE:master" --cache-from "$IMAGE:latest" -t "$IMAGE:$SHA" .
        fi
      - docker tag "$IMAGE:$SHA" "$IMAGE:$BRANCH"
  post_build:
    commands:
      - |
        if [ "$CODEBUILD_BUILD_SUCCEEDING" = "1" ]; then
          docker push "$IMAGE:$SHA"
          docker push "$IMAGE:$BRANCH"
        fi
      - printf '\004'
"#;

/// Render the buildspec for a project building `repository`.
///
/// `sha` and `branch` are the defaults baked into the project; every build
/// overrides them through its environment. Cached layers are pulled from the
/// branch tag, then `master`, then `latest`. The final command prints the log
/// sentinel so readers know the output is complete.
pub fn buildspec(repository: &str, image: &str, sha: &str, branch: &str) -> String {
    BUILDSPEC_TEMPLATE
        .replace("{repository}", repository)
        .replace("{image}", image)
        .replace("{sha}", sha)
        .replace("{branch}", branch)
}
