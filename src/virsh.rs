use crate::executor::{RemoteCommand, shell_escape};

/// Storage handling for a live migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Disk already reachable from both hosts.
    Shared,
    /// Disk streamed along with memory (`--copy-storage-all`).
    Copy,
}

/// Builds `virsh` command lines against one libvirt URI.
#[derive(Debug, Clone)]
pub struct Virsh {
    uri: String,
}

impl Virsh {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn command<'a>(&'a self, args: impl IntoIterator<Item = &'a str>) -> RemoteCommand {
        let mut full = vec!["-c", self.uri.as_str()];
        full.extend(args);
        RemoteCommand::from_args("virsh", full)
    }

    pub fn dumpxml(&self, vm: &str) -> RemoteCommand {
        self.command(["dumpxml", vm])
    }

    /// Dumps the definition into `path`, creating the parent directory.
    pub fn dumpxml_to(&self, vm: &str, path: &str) -> RemoteCommand {
        let parent = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(".");
        let parent = if parent.is_empty() { "/" } else { parent };
        RemoteCommand::new(format!(
            "mkdir -p {} && {} > {}",
            shell_escape(parent),
            self.dumpxml(vm).script(),
            shell_escape(path)
        ))
    }

    pub fn dominfo(&self, vm: &str) -> RemoteCommand {
        self.command(["dominfo", vm])
    }

    pub fn define(&self, xml_path: &str) -> RemoteCommand {
        self.command(["define", xml_path])
    }

    pub fn undefine(&self, vm: &str) -> RemoteCommand {
        self.command(["undefine", vm])
    }

    pub fn undefine_with_storage(&self, vm: &str) -> RemoteCommand {
        self.command(["undefine", vm, "--remove-all-storage"])
    }

    pub fn start(&self, vm: &str) -> RemoteCommand {
        self.command(["start", vm])
    }

    pub fn shutdown(&self, vm: &str) -> RemoteCommand {
        self.command(["shutdown", vm])
    }

    pub fn destroy(&self, vm: &str) -> RemoteCommand {
        self.command(["destroy", vm])
    }

    /// Persistent, verbose live migration of `vm` to `destination_uri`, with
    /// the data stream pinned to `migrate_uri`.
    pub fn migrate(
        &self,
        vm: &str,
        destination_uri: &str,
        migrate_uri: &str,
        storage: StorageMode,
    ) -> RemoteCommand {
        let mut args = vec!["migrate", "--live", "--persistent", "--unsafe", "--verbose"];
        if storage == StorageMode::Copy {
            args.push("--copy-storage-all");
        }
        args.extend([vm, destination_uri, "--migrateuri", migrate_uri]);
        self.command(args)
    }
}

impl Default for Virsh {
    fn default() -> Self {
        Self::new("qemu:///system")
    }
}
