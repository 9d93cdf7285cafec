use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("root module {path} is not a directory")]
    NotADirectory { path: String },
    #[error("failed to create temp workspace: {0}")]
    TempDir(#[source] std::io::Error),
    #[error("failed to copy {path}: {source}")]
    Copy {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A private copy of a root module. The directory is removed on drop.
#[derive(Debug)]
pub struct IsolatedModule {
    root: TempDir,
    module_dir: PathBuf,
}

impl IsolatedModule {
    pub fn path(&self) -> &Path {
        &self.module_dir
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }
}

fn is_skipped(name: &str) -> bool {
    name.starts_with('.')
        || name == "terraform.tfstate"
        || name.starts_with("terraform.tfstate.")
}

/// Copies `source` into a fresh temp directory, leaving behind local state,
/// provider caches and dot files so parallel runs never share them.
pub fn copy_module_to_temp(source: &Path) -> Result<IsolatedModule, WorkspaceError> {
    if !source.is_dir() {
        return Err(WorkspaceError::NotADirectory {
            path: source.display().to_string(),
        });
    }
    let root = tempfile::Builder::new()
        .prefix("terraform-aws-mfa-")
        .tempdir()
        .map_err(WorkspaceError::TempDir)?;
    let name = source
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "module".into());
    let module_dir = root.path().join(name);
    copy_dir(source, &module_dir)?;
    Ok(IsolatedModule { root, module_dir })
}

fn copy_dir(from: &Path, to: &Path) -> Result<(), WorkspaceError> {
    let copy_err = |path: &Path, source| WorkspaceError::Copy {
        path: path.display().to_string(),
        source,
    };
    fs::create_dir_all(to).map_err(|e| copy_err(to, e))?;
    let entries = fs::read_dir(from).map_err(|e| copy_err(from, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| copy_err(from, e))?;
        let name = entry.file_name();
        if is_skipped(&name.to_string_lossy()) {
            continue;
        }
        let src = entry.path();
        let dst = to.join(&name);
        let mut file_type = entry.file_type().map_err(|e| copy_err(&src, e))?;
        if file_type.is_symlink() {
            // Links are materialized so relative targets outside the module keep resolving.
            file_type = fs::metadata(&src).map_err(|e| copy_err(&src, e))?.file_type();
        }
        if file_type.is_dir() {
            copy_dir(&src, &dst)?;
        } else {
            fs::copy(&src, &dst).map_err(|e| copy_err(&src, e))?;
        }
    }
    Ok(())
}
