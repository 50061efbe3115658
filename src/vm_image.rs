use std::fmt;
use std::path::{Path, PathBuf};

/// A disk image path and the VM name derived from it (the file stem).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmImage {
    path: PathBuf,
    name: String,
}

impl VmImage {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = derive_vm_name(&path);
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for VmImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.path.display())
    }
}

fn derive_vm_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}
