//! File and directory naming inside the managed library

use std::io;
use std::path::{Path, PathBuf};

use crate::models::AssetKind;

/// Make `name` safe to use as a single path component on every desktop OS.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '?' | ':' | '"' => {}
            '<' => out.push('('),
            '>' => out.push(')'),
            '/' | '\\' | '|' | '*' => out.push('-'),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    // Windows refuses names ending in a dot or space.
    out.trim().trim_end_matches(&['.', ' '][..]).to_string()
}

/// `Artist - Title`, sanitized. Shared by the song directory and its files.
pub fn song_stem(artist: &str, title: &str) -> String {
    let stem = sanitize_filename(&format!("{} - {}", artist.trim(), title.trim()));
    if stem.is_empty() || stem == "-" {
        "untitled".to_string()
    } else {
        stem
    }
}

/// File name of an asset inside the song directory.
pub fn asset_file_name(stem: &str, kind: AssetKind, extension: &str) -> String {
    match kind {
        AssetKind::Cover => format!("{} [CO].{}", stem, extension),
        AssetKind::Background => format!("{} [BG].{}", stem, extension),
        _ => format!("{}.{}", stem, extension),
    }
}

/// Create `<root>/<stem>`, or `<root>/<stem> (n)` for the first free `n`.
///
/// Uses `create_dir` so two jobs with the same stem never share a directory.
pub async fn create_unique_dir(root: &Path, stem: &str) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(root).await?;

    let mut n = 0u32;
    loop {
        let candidate = suffixed(root, stem, n);
        match tokio::fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

fn suffixed(parent: &Path, stem: &str, n: u32) -> PathBuf {
    if n == 0 {
        parent.join(stem)
    } else {
        parent.join(format!("{} ({})", stem, n))
    }
}

/// True when `name` is `stem` or `stem (n)`.
pub fn is_name_with_suffix(name: &str, stem: &str) -> bool {
    let Some(rest) = name.strip_prefix(stem) else {
        return false;
    };
    rest.is_empty()
        || rest
            .strip_prefix(" (")
            .and_then(|r| r.strip_suffix(')'))
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Rename `dir` to `<stem>`, or `<stem> (n)` for the first free `n`, next to
/// where it is. A directory already named after `stem` stays put.
///
/// Returns the directory's path afterwards.
pub async fn ensure_dir_name(dir: &Path, stem: &str) -> io::Result<PathBuf> {
    let named = dir
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| is_name_with_suffix(name, stem));
    if named {
        return Ok(dir.to_path_buf());
    }
    let parent = dir.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", dir.display()),
        )
    })?;

    let mut n = 0u32;
    loop {
        let candidate = suffixed(parent, stem, n);
        if tokio::fs::try_exists(&candidate).await? {
            n += 1;
            continue;
        }
        tokio::fs::rename(dir, &candidate).await?;
        return Ok(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("What?: \"Yes\""), "What Yes");
        assert_eq!(sanitize_filename("<a>"), "(a)");
        assert_eq!(sanitize_filename("AC/DC|x*y\\z"), "AC-DC-x-y-z");
        assert_eq!(sanitize_filename("Trailing dots. . ."), "Trailing dots");
    }

    #[test]
    fn test_song_stem() {
        assert_eq!(song_stem("AC/DC", "T.N.T."), "AC-DC - T.N.T");
        assert_eq!(song_stem("", ""), "untitled");
    }

    #[test]
    fn test_asset_file_names() {
        assert_eq!(asset_file_name("A - T", AssetKind::Notes, "txt"), "A - T.txt");
        assert_eq!(asset_file_name("A - T", AssetKind::Audio, "m4a"), "A - T.m4a");
        assert_eq!(asset_file_name("A - T", AssetKind::Cover, "jpg"), "A - T [CO].jpg");
        assert_eq!(
            asset_file_name("A - T", AssetKind::Background, "jpg"),
            "A - T [BG].jpg"
        );
    }

    #[tokio::test]
    async fn test_create_unique_dir() {
        let root = tempfile::tempdir().unwrap();

        let first = create_unique_dir(root.path(), "A - T").await.unwrap();
        let second = create_unique_dir(root.path(), "A - T").await.unwrap();
        let third = create_unique_dir(root.path(), "A - T").await.unwrap();

        assert_eq!(first, root.path().join("A - T"));
        assert_eq!(second, root.path().join("A - T (1)"));
        assert_eq!(third, root.path().join("A - T (2)"));
        assert!(third.is_dir());
    }

    #[test]
    fn test_is_name_with_suffix() {
        assert!(is_name_with_suffix("A - T", "A - T"));
        assert!(is_name_with_suffix("A - T (12)", "A - T"));
        assert!(!is_name_with_suffix("A - T (x)", "A - T"));
        assert!(!is_name_with_suffix("A - T ()", "A - T"));
        assert!(!is_name_with_suffix("A - T2", "A - T"));
        assert!(!is_name_with_suffix("A - Other", "A - T"));
    }

    #[tokio::test]
    async fn test_ensure_dir_name() {
        let root = tempfile::tempdir().unwrap();
        let old = create_unique_dir(root.path(), "A - Old").await.unwrap();
        std::fs::write(old.join("00001.usdb"), b"{}").unwrap();
        create_unique_dir(root.path(), "A - New").await.unwrap();

        let moved = ensure_dir_name(&old, "A - New").await.unwrap();
        assert_eq!(moved, root.path().join("A - New (1)"));
        assert!(moved.join("00001.usdb").is_file());
        assert!(!old.exists());

        // Already named after the stem, suffix included
        assert_eq!(ensure_dir_name(&moved, "A - New").await.unwrap(), moved);
    }
}
