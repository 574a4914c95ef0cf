// On-disk layout under the storage root

use std::path::{Path, PathBuf};

/// Where everything lives under `storage_path`
///
/// ```text
/// <root>/Recordings/   finished clips
/// <root>/archive/      persisted frame archives, one <source>.dat each
/// <root>/faces/        enrollment images and unrecognized face crops
/// <root>/vigil.db      recording log and face encodings
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.root.join("Recordings")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn faces_dir(&self) -> PathBuf {
        self.root.join("faces")
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join("vigil.db")
    }

    pub fn archive_path(&self, source_name: &str) -> PathBuf {
        self.archive_dir()
            .join(format!("{}.dat", sanitize_name(source_name)))
    }

    /// Create every directory of the layout
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.recordings_dir())?;
        std::fs::create_dir_all(self.archive_dir())?;
        std::fs::create_dir_all(self.faces_dir())?;
        Ok(())
    }
}

/// Make a source name safe to embed in a file name
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "source".to_string()
    } else {
        cleaned
    }
}

/// First path of `dir/stem.ext`, `dir/stem_1.ext`, `dir/stem_2.ext`, ... that does not exist
pub fn unique_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let candidate = dir.join(format!("{}.{}", stem, extension));
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{}_{}.{}", stem, n, extension));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
