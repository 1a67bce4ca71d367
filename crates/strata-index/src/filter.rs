use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Generated file patterns to skip.
const GENERATED_PATTERNS: &[&str] = &[
    ".generated.",
    ".min.js",
    ".min.css",
    "_pb2.py",
    ".pb.go",
];

/// Vendor directories to skip.
const VENDOR_DIRS: &[&str] = &[
    "vendor",
    "node_modules",
    "third_party",
    ".venv",
    "venv",
];

/// Extensions that are binary by definition.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "pdf", "zip", "tar", "gz", "exe", "dll", "so",
    "dylib", "bin", "o", "a", "class", "pyc", "wasm", "woff", "woff2", "ttf",
];

const MAX_FILE_SIZE: u64 = 1_048_576;
const BINARY_SNIFF_BYTES: usize = 8192;

/// Normalizes and filters incoming file paths for incremental indexing:
/// canonical separators, dedupe, and drops for vendor dirs, generated files,
/// binary files, and oversized files.
#[derive(Debug, Default)]
pub struct FileFilter {
    repo_root: Option<PathBuf>,
}

impl FileFilter {
    pub fn new(repo_root: Option<PathBuf>) -> Self {
        Self { repo_root }
    }

    /// Apply normalization and all drop rules, preserving input order.
    pub fn normalize_and_filter(&self, file_paths: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for raw in file_paths {
            let path = normalize_path(raw);
            if path.is_empty() || !seen.insert(path.clone()) {
                continue;
            }
            if in_vendor_dir(&path) || is_generated_file(&path) || has_binary_extension(&path) {
                continue;
            }
            if let Some(root) = &self.repo_root {
                let abs = root.join(&path);
                match std::fs::metadata(&abs) {
                    Ok(meta) if meta.len() > MAX_FILE_SIZE => continue,
                    Ok(_) => {
                        if sniffs_binary(&abs) {
                            continue;
                        }
                    }
                    // Missing files pass through; deletion handling is the
                    // indexer's concern, not the filter's.
                    Err(_) => {}
                }
            }
            out.push(path);
        }
        out
    }
}

/// Forward slashes, no leading `./`.
fn normalize_path(raw: &str) -> String {
    let mut path = raw.replace('\\', "/");
    while let Some(stripped) = path.strip_prefix("./") {
        path = stripped.to_string();
    }
    path.trim_matches('/').to_string()
}

fn in_vendor_dir(path: &str) -> bool {
    path.split('/').any(|seg| VENDOR_DIRS.contains(&seg))
}

fn is_generated_file(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    GENERATED_PATTERNS.iter().any(|p| name.contains(p))
}

fn has_binary_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| BINARY_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Null byte in the head of the file means binary.
pub fn sniffs_binary(abs_path: &Path) -> bool {
    use std::io::Read;
    let mut buf = [0u8; BINARY_SNIFF_BYTES];
    match std::fs::File::open(abs_path) {
        Ok(mut f) => match f.read(&mut buf) {
            Ok(n) => buf[..n].contains(&0),
            Err(_) => true,
        },
        Err(_) => false,
    }
}

/// Same null-byte sniff over in-memory content.
pub fn is_binary(content: &[u8]) -> bool {
    content[..content.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

/// Shared with the lexical reindex walk: generated-file check on a path.
pub(crate) fn is_generated_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| GENERATED_PATTERNS.iter().any(|p| name.contains(p)))
        .unwrap_or(false)
}

/// Shared with the lexical reindex walk: vendor-dir check on a dir name.
pub(crate) fn is_vendor_dir_name(name: &str) -> bool {
    VENDOR_DIRS.contains(&name)
}
