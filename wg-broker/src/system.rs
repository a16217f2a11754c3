//! Adapter discovery and privileged install actions

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;

const SYS_CLASS_NET: &str = "/sys/class/net";
const TUN_DEVICE: &str = "/dev/net/tun";

/// Names of TUN/TAP interfaces under a sysfs `class/net` directory
pub fn tap_list_in(root: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = std::fs::read_dir(root)
        .with_context(|| format!("Failed to read {}", root.display()))?
        .flatten()
        .filter(|entry| entry.path().join("tun_flags").exists())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    Ok(names)
}

/// TUN/TAP interfaces present on the host
pub fn tap_list() -> Result<Vec<String>> {
    tap_list_in(Path::new(SYS_CLASS_NET))
}

/// Make sure the TUN driver is available, loading it if needed
pub async fn check_and_install_driver() -> Result<bool> {
    if Path::new(TUN_DEVICE).exists() {
        return Ok(true);
    }

    log::info!("{} missing, loading tun module", TUN_DEVICE);
    let output = Command::new("modprobe")
        .arg("tun")
        .output()
        .await
        .context("Failed to execute modprobe")?;
    if !output.status.success() {
        log::error!(
            "modprobe tun failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.status.success())
}

/// First executable regular file below `dir`, in path order
pub fn find_executable(dir: &Path) -> Result<Option<PathBuf>> {
    let mut pending = vec![dir.to_path_buf()];
    let mut found = Vec::new();
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)?.flatten() {
            let path = entry.path();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                pending.push(path);
            } else if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found.into_iter().next())
}

fn first_tar(dir: &Path) -> Result<Option<PathBuf>> {
    let mut tars: Vec<PathBuf> = std::fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "tar"))
        .collect();
    tars.sort();
    Ok(tars.into_iter().next())
}

async fn run_status(program: &str, args: &[&OsStr]) -> Result<i32> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", program))?;
    if !output.status.success() {
        log::error!(
            "{} failed: {}",
            program,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.status.code().unwrap_or(-1))
}

/// Fresh private (0700) directory with an unpredictable name
fn extraction_dir() -> Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("wg-broker-update-")
        .tempdir()
        .context("Failed to create extraction directory")
}

/// Unpack an update bundle (zip holding a tar) and run its installer.
///
/// Returns the installer's exit status, the failing extractor's status, or
/// `-1` when the bundle has no tar or no executable.
pub async fn install_app(bundle: &Path) -> Result<i32> {
    // Removed when dropped, on every return path
    let extract = extraction_dir()?;
    let extract_dir = extract.path();
    log::info!(
        "Installing {} via {}",
        bundle.display(),
        extract_dir.display()
    );

    let status = run_status(
        "unzip",
        &[OsStr::new("-o"), bundle.as_os_str(), OsStr::new("-d"), extract_dir.as_os_str()],
    )
    .await?;
    if status != 0 {
        return Ok(status);
    }

    let Some(tar) = first_tar(extract_dir)? else {
        log::error!("No tar archive in {}", bundle.display());
        return Ok(-1);
    };
    let status = run_status(
        "tar",
        &[OsStr::new("-xf"), tar.as_os_str(), OsStr::new("-C"), extract_dir.as_os_str()],
    )
    .await?;
    if status != 0 {
        return Ok(status);
    }
    let _ = tokio::fs::remove_file(&tar).await;

    let Some(installer) = find_executable(extract_dir)? else {
        log::error!("No executable in {}", bundle.display());
        return Ok(-1);
    };
    log::info!("Running installer {}", installer.display());
    let status = Command::new(&installer)
        .status()
        .await
        .with_context(|| format!("Failed to run {}", installer.display()))?;
    Ok(status.code().unwrap_or(-1))
}

/// Attach or detach a disk image; a no-op returning 0 off macOS
pub async fn mount_image(path: &Path, mount: bool) -> Result<i32> {
    if !cfg!(target_os = "macos") {
        return Ok(0);
    }
    let verb = if mount { "attach" } else { "detach" };
    run_status("hdiutil", &[OsStr::new(verb), path.as_os_str()]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_tap_list_in() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["eth0", "tun0", "tap1"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("tun0/tun_flags"), "0x1001\n").unwrap();
        fs::write(dir.path().join("tap1/tun_flags"), "0x1002\n").unwrap();

        assert_eq!(tap_list_in(dir.path()).unwrap(), vec!["tap1", "tun0"]);
    }

    #[test]
    fn test_find_executable() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("README"), "docs").unwrap();
        assert!(find_executable(dir.path()).unwrap().is_none());

        fs::create_dir(dir.path().join("bin")).unwrap();
        let installer = dir.path().join("bin/install.sh");
        fs::write(&installer, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&installer, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(find_executable(dir.path()).unwrap(), Some(installer));
    }

    #[test]
    fn test_first_tar() {
        let dir = tempfile::tempdir().unwrap();
        assert!(first_tar(dir.path()).unwrap().is_none());
        fs::write(dir.path().join("b.tar"), "").unwrap();
        fs::write(dir.path().join("a.tar"), "").unwrap();
        fs::write(dir.path().join("a.zip"), "").unwrap();
        assert_eq!(first_tar(dir.path()).unwrap(), Some(dir.path().join("a.tar")));
    }

    #[test]
    fn test_extraction_dir_is_private_and_removed() {
        let first = extraction_dir().unwrap();
        let second = extraction_dir().unwrap();
        assert_ne!(first.path(), second.path());

        let mode = fs::metadata(first.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        let path = first.path().to_path_buf();
        drop(first);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_mount_image_off_macos() {
        if !cfg!(target_os = "macos") {
            assert_eq!(mount_image(Path::new("/tmp/x.dmg"), true).await.unwrap(), 0);
        }
    }
}
