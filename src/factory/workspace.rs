use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use super::models::FileEntry;
use crate::errors::{FactoryError, FactoryResult};

/// Directory under the project dir that the generator writes into.
pub const GENERATION_DIR: &str = "generated-app";

/// Dependency and VCS housekeeping directories never walked into.
pub const SKIP_DIRS: &[&str] = &["node_modules", ".pnpm", ".git"];

/// Extensions served as a placeholder instead of file content.
pub const BINARY_EXTENSIONS: &[&str] = &[
    "ico", "png", "jpg", "jpeg", "gif", "webp", "bmp", "tiff", "tif", // images
    "woff", "woff2", "ttf", "otf", "eot", // fonts
    "zip", "tar", "gz", "bz2", "xz", "7z", "rar", // archives
    "exe", "bin", "dll", "so", "dylib", // executables
    "pdf", "mp4", "mp3", "avi", "mov", "wav",
];

const BINARY_NOTICE: &str = "This file cannot be displayed as text in the code viewer.";

/// Directories allocated for one project.
#[derive(Debug, Clone, PartialEq)]
pub struct Workspace {
    /// `<root>/<user>/<project>`
    pub project_dir: PathBuf,
    /// `<root>/<user>/<project>/generated-app`
    pub generation_root: PathBuf,
}

/// Allocates per-project directory trees under a single root.
#[derive(Debug, Clone)]
pub struct WorkspaceProvisioner {
    root: PathBuf,
}

impl WorkspaceProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the workspace paths without touching the filesystem.
    pub fn workspace_for(&self, user_id: &str, project_id: &str) -> FactoryResult<Workspace> {
        let user = single_segment(&self.root, user_id)?;
        let project = single_segment(&self.root, project_id)?;
        let project_dir = self.root.join(user).join(project);
        Ok(Workspace {
            generation_root: generation_root(&project_dir),
            project_dir,
        })
    }

    /// Create the workspace tree. Creating an existing tree is not an error.
    pub async fn provision(&self, user_id: &str, project_id: &str) -> FactoryResult<Workspace> {
        let workspace = self.workspace_for(user_id, project_id)?;
        tokio::fs::create_dir_all(&workspace.generation_root).await?;
        tracing::debug!(
            project_id,
            path = %workspace.generation_root.display(),
            "workspace provisioned"
        );
        Ok(workspace)
    }
}

pub fn generation_root(project_dir: &Path) -> PathBuf {
    project_dir.join(GENERATION_DIR)
}

fn single_segment<'a>(base: &Path, segment: &'a str) -> FactoryResult<&'a str> {
    let mut components = Path::new(segment).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == segment => Ok(segment),
        _ => Err(escape(segment, base)),
    }
}

fn escape(path: impl AsRef<Path>, base: &Path) -> FactoryError {
    FactoryError::SandboxEscape {
        path: path.as_ref().display().to_string(),
        base: base.display().to_string(),
    }
}

/// Lexically normalize a path, resolving `.` and `..`.
///
/// Returns `None` when `..` climbs above the first component.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(c) => {
                out.push(c);
                depth += 1;
            }
            Component::RootDir | Component::Prefix(_) => out.push(component.as_os_str()),
        }
    }
    Some(out)
}

/// Resolve `relative` against `base`, rejecting anything that lands outside.
///
/// Resolution is purely lexical so it is safe to call before the target
/// exists. Absolute inputs are accepted only when they already sit inside
/// `base`.
pub fn resolve_within(base: &Path, relative: &str) -> FactoryResult<PathBuf> {
    let base_norm = normalize(base).ok_or_else(|| escape(base, base))?;
    let candidate = if Path::new(relative).is_absolute() {
        PathBuf::from(relative)
    } else {
        base.join(relative)
    };
    let resolved = normalize(&candidate).ok_or_else(|| escape(relative, base))?;
    if !resolved.starts_with(&base_norm) {
        return Err(escape(relative, base));
    }
    Ok(resolved)
}

pub fn is_skipped(name: &str) -> bool {
    SKIP_DIRS.contains(&name)
}

fn relative_display(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn entry_for(base: &Path, path: &Path, metadata: &std::fs::Metadata) -> FileEntry {
    let updated_at = metadata.modified().ok().map(DateTime::<Utc>::from);
    FileEntry {
        path: relative_display(base, path),
        is_dir: metadata.is_dir(),
        size: metadata.is_file().then(|| metadata.len()),
        updated_at,
    }
}

/// Recursively list the files below `base/relative`, sorted by path.
///
/// Paths in the result are relative to `base`. A missing target yields an
/// empty listing.
pub fn list_files(base: &Path, relative: Option<&str>) -> FactoryResult<Vec<FileEntry>> {
    let base = normalize(base).ok_or_else(|| escape(base, base))?;
    let target = match relative {
        Some(rel) if !rel.trim().is_empty() => resolve_within(&base, rel)?,
        _ => base.clone(),
    };
    if !target.exists() {
        return Ok(Vec::new());
    }
    if target.is_file() {
        let metadata = std::fs::metadata(&target)?;
        return Ok(vec![entry_for(&base, &target, &metadata)]);
    }

    let mut entries = Vec::new();
    let walker = WalkDir::new(&target)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && is_skipped(&e.file_name().to_string_lossy())));
    for entry in walker {
        let entry = entry.map_err(|e| anyhow::anyhow!("Failed to walk workspace: {}", e))?;
        let metadata = entry
            .metadata()
            .map_err(|e| anyhow::anyhow!("Failed to stat {}: {}", entry.path().display(), e))?;
        entries.push(entry_for(&base, entry.path(), &metadata));
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn binary_placeholder(extension: Option<&str>) -> String {
    match extension {
        Some(ext) => format!("[Binary file: .{}]\n{}", ext, BINARY_NOTICE),
        None => format!("[Binary file]\n{}", BINARY_NOTICE),
    }
}

/// Read a text file below `base` for display.
///
/// Anything under `node_modules` is reported as missing, directories are a
/// `BadRequest`, and binary content comes back as a short placeholder.
/// Symlinks are followed only while the target stays inside `base`.
pub fn read_file(base: &Path, relative: &str) -> FactoryResult<String> {
    let not_found = || FactoryError::FileNotFound {
        path: relative.to_string(),
    };
    let target = resolve_within(base, relative)?;
    let inside = target
        .strip_prefix(normalize(base).unwrap_or_default())
        .unwrap_or(target.as_path());
    if inside.components().any(|c| c.as_os_str() == "node_modules") {
        return Err(not_found());
    }
    if !target.exists() {
        return Err(not_found());
    }
    let real_base = base.canonicalize()?;
    let real_target = target.canonicalize()?;
    if !real_target.starts_with(&real_base) {
        return Err(escape(relative, base));
    }
    if real_target.is_dir() {
        return Err(FactoryError::BadRequest("Path points to a directory".to_string()));
    }

    let extension = real_target
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase());
    if let Some(ext) = extension.as_deref()
        && BINARY_EXTENSIONS.contains(&ext)
    {
        return Ok(binary_placeholder(Some(ext)));
    }
    let bytes = std::fs::read(&real_target)?;
    Ok(String::from_utf8(bytes).unwrap_or_else(|_| binary_placeholder(None)))
}
