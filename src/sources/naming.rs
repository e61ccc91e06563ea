/// Forces resolution through the local daemon.
pub const DAEMON_PREFIX: &str = "daemon://";
/// Forces resolution through the remote registry.
pub const REMOTE_PREFIX: &str = "remote://";

const TAR_SUFFIXES: [&str; 3] = [".tar", ".tar.gz", ".tgz"];

/// Turns an image identifier into a temp directory prefix.
/// Drops separators that are awkward in file names and appends a dash so the
/// random suffix stays readable.
pub fn workdir_prefix(identifier: &str) -> String {
    let sanitized: String = identifier
        .chars()
        .filter(|c| !matches!(c, ':' | '/' | '@' | '\\') && !c.is_whitespace())
        .collect();

    if sanitized.is_empty() {
        "image-".to_string()
    } else {
        format!("{}-", sanitized)
    }
}

/// True when the identifier names an image archive rather than a reference.
pub fn looks_like_tar_path(identifier: &str) -> bool {
    TAR_SUFFIXES.iter().any(|suffix| identifier.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workdir_prefix() {
        assert_eq!(workdir_prefix("ubuntu:20.04"), "ubuntu20.04-");
        assert_eq!(
            workdir_prefix("gcr.io/project/app@sha256:abc"),
            "gcr.ioprojectappsha256abc-"
        );
        assert_eq!(workdir_prefix("./images/my image.tar"), ".imagesmyimage.tar-");
        assert_eq!(workdir_prefix("://"), "image-");
    }

    #[test]
    fn test_looks_like_tar_path() {
        assert!(looks_like_tar_path("image.tar"));
        assert!(looks_like_tar_path("/tmp/image.tar.gz"));
        assert!(looks_like_tar_path("image.tgz"));
        assert!(!looks_like_tar_path("ubuntu:latest"));
        assert!(!looks_like_tar_path("registry.example.com/tar:v1"));
    }
}
