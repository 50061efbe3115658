use crate::credentials::Credentials;
use crate::executor::{Host, RemoteCommand, RemoteExecutor};
use crate::{Result, ShiftError, log_info, log_warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How the disk image gets to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Image already visible to both hosts under the shared mount.
    SharedStorage,
    /// Image copied point-to-point into local VM storage.
    Copy,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::SharedStorage => "shared-storage",
            Transport::Copy => "copy",
        }
    }
}

/// Shared-storage precondition: the image must exist under the mount.
pub fn resolve_shared_image(mount: &Path, image_name: &str) -> Result<PathBuf> {
    let path = mount.join(image_name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(ShiftError::ImageNotFound(path.display().to_string()))
    }
}

pub struct ImageCopier {
    executor: Arc<dyn RemoteExecutor>,
}

impl ImageCopier {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    /// Finds the first file named `image_name` anywhere on `host`.
    pub async fn locate(
        &self,
        host: &Host,
        credentials: &Credentials,
        image_name: &str,
    ) -> Result<String> {
        log_info!("Searching for {} on remote host {}", image_name, host);

        let find = RemoteCommand::new(format!(
            "{} 2>/dev/null",
            RemoteCommand::from_args("find", ["/", "-type", "f", "-name", image_name]).script()
        ))
        .as_privileged();

        // find exits non-zero on unreadable directories; only the paths matter.
        let output = self.executor.run(host, credentials, &find, None).await?;
        output
            .stdout_str()
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                ShiftError::ImageNotFound(format!("no image named '{}' on {}", image_name, host))
            })
    }

    /// Copies `remote_path` into `local_dest`, creating it if needed. The
    /// final name only appears once the transfer has completed.
    pub async fn copy(
        &self,
        host: &Host,
        credentials: &Credentials,
        remote_path: &str,
        local_dest: &Path,
    ) -> Result<PathBuf> {
        let file_name = Path::new(remote_path)
            .file_name()
            .ok_or_else(|| copy_failure(remote_path, "remote path has no file name".to_string()))?;

        tokio::fs::create_dir_all(local_dest)
            .await
            .map_err(|e| copy_failure(remote_path, format!("cannot create {}: {}", local_dest.display(), e)))?;

        let target = local_dest.join(file_name);
        let partial = partial_path(&target);

        log_info!("Starting copy of {} from {}", remote_path, host);
        let result = self
            .executor
            .copy_from(host, credentials, remote_path, &partial)
            .await;

        match result {
            Ok(output) if output.success() => {}
            Ok(output) => {
                discard(&partial).await;
                return Err(copy_failure(remote_path, output.diagnostics()));
            }
            Err(err @ ShiftError::AuthenticationRejected { .. }) => {
                discard(&partial).await;
                return Err(err);
            }
            Err(err) => {
                discard(&partial).await;
                return Err(copy_failure(remote_path, err.to_string()));
            }
        }

        if let Err(e) = tokio::fs::rename(&partial, &target).await {
            discard(&partial).await;
            return Err(copy_failure(
                remote_path,
                format!("cannot move into {}: {}", target.display(), e),
            ));
        }

        log_info!("VM image copied to {}", target.display());
        Ok(target)
    }
}

pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".part-{}", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

pub(crate) async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            log_warn!("Could not remove partial file {}: {}", path.display(), e);
        }
    }
}

fn copy_failure(remote_path: &str, reason: String) -> ShiftError {
    ShiftError::CopyFailure {
        source_path: remote_path.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CopyReply, Reply, ScriptedExecutor};
    use tempfile::TempDir;

    fn host() -> Host {
        Host::remote("10.0.0.5")
    }

    fn creds() -> Credentials {
        Credentials::new("ops", "pw")
    }

    #[test]
    fn test_shared_image_must_exist() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("web01.img"), b"disk").unwrap();

        assert_eq!(
            resolve_shared_image(dir.path(), "web01.img").unwrap(),
            dir.path().join("web01.img")
        );
        assert!(matches!(
            resolve_shared_image(dir.path(), "db01.img"),
            Err(ShiftError::ImageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_copy_creates_destination_and_promotes() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("vms");
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on_copy("web01.img", CopyReply::Content(b"disk bytes".to_vec()));

        let copier = ImageCopier::new(executor.clone());
        let path = copier
            .copy(&host(), &creds(), "/var/lib/libvirt/images/web01.img", &dest)
            .await
            .unwrap();

        assert_eq!(path, dest.join("web01.img"));
        assert_eq!(std::fs::read(&path).unwrap(), b"disk bytes");
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 1);
        assert_ne!(executor.copies()[0].local_path, path);
    }

    #[tokio::test]
    async fn test_interrupted_copy_leaves_no_final_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("vms");
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on_copy("web01.img", CopyReply::Interrupted(b"half a di".to_vec()));

        let copier = ImageCopier::new(executor);
        let err = copier
            .copy(&host(), &creds(), "/var/lib/libvirt/images/web01.img", &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, ShiftError::CopyFailure { .. }));
        assert!(!dest.join("web01.img").exists());
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_transport_error_is_copy_failure() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on_copy("web01.img", CopyReply::Reply(Reply::Unreachable));

        let err = ImageCopier::new(executor)
            .copy(&host(), &creds(), "/images/web01.img", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ShiftError::CopyFailure { .. }));
    }

    #[tokio::test]
    async fn test_locate_takes_first_match() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on(
            "find / -type f -name web01.img",
            Reply::Output(crate::executor::CommandOutput::new(
                1,
                "/var/lib/libvirt/images/web01.img\n/backup/web01.img\n",
                "",
            )),
        );

        let copier = ImageCopier::new(executor.clone());
        let path = copier.locate(&host(), &creds(), "web01.img").await.unwrap();
        assert_eq!(path, "/var/lib/libvirt/images/web01.img");
        assert!(executor.calls()[0].privileged);
    }

    #[tokio::test]
    async fn test_locate_nothing_found() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("find", Reply::ok(""));

        let err = ImageCopier::new(executor)
            .locate(&host(), &creds(), "ghost.img")
            .await
            .unwrap_err();
        assert!(matches!(err, ShiftError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn test_locate_auth_rejected() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("find", Reply::AuthRejected);

        let err = ImageCopier::new(executor)
            .locate(&host(), &creds(), "web01.img")
            .await
            .unwrap_err();
        assert!(err.is_authentication());
    }
}
