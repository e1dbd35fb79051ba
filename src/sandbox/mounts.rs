//! Bind-mount, chroot, and `/proc` setup performed inside `sandbox-init`
//! once namespaces are active.

use std::path::{Path, PathBuf};

use log::debug;
use nix::mount::MsFlags;

use crate::error::prelude::*;
use crate::model::BindMount;

const DEV_BINDS: [&str; 4] = ["/dev/null", "/dev/zero", "/dev/random", "/dev/urandom"];

fn bind_mount(root: &Path, path: &Path, target: &Path, read_only: bool) -> Result {
    if !path.is_absolute() {
        bail!("Bind mount source must be absolute: {}", path.display());
    }

    let no_root_target = target.strip_prefix("/").unwrap_or(target);
    let full_path = root.join(no_root_target);

    debug!("Bind mounting {} to {}", path.display(), full_path.display());

    if path.is_dir() {
        std::fs::create_dir_all(&full_path).context("Couldn't create bind mount target dir")?;
    } else {
        std::fs::create_dir_all(full_path.parent().context("Couldn't get parent")?)
            .context("Couldn't create bind mount target parent")?;
        std::fs::File::create(&full_path).context("Couldn't create bind mount target file")?;
    }

    let mut flags = MsFlags::MS_BIND | MsFlags::MS_PRIVATE | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }

    nix::mount::mount(Some(path), &full_path, None::<&str>, flags, None::<&str>)
        .context("Couldn't run bind mount syscall")
}

fn mount_proc(root: &Path) -> Result {
    let proc_path = root.join("proc");
    std::fs::create_dir_all(&proc_path).context("Couldn't create /proc directory")?;
    debug!("Mounting procfs at {}", proc_path.display());
    nix::mount::mount(
        None::<&str>,
        &proc_path,
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .context("Couldn't run proc mount syscall")
}

fn mount_tmpfs(root: &Path, size: &str) -> Result {
    debug!("Mounting tmpfs at {}", root.display());
    let opts = format!("mode=0755,size={size}");
    nix::mount::mount(
        None::<&str>,
        root,
        Some("tmpfs"),
        MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
        Some(opts.as_str()),
    )
    .context("Couldn't mount tmpfs")
}

/// Makes `/` private-recursive, mounts a fresh tmpfs as the new root, then
/// applies the profile's bind mounts and the standard `/dev` passthroughs.
pub fn setup_rootfs(root: &Path, bind_mounts: &[BindMount], tmpfs_size: &str) -> Result {
    nix::mount::mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("Couldn't make / private-recursive")?;

    mount_tmpfs(root, tmpfs_size)?;
    mount_proc(root)?;

    for bm in bind_mounts {
        let source = PathBuf::from(&bm.source);
        let target = PathBuf::from(&bm.target);
        bind_mount(root, &source, &target, bm.read_only)
            .with_context(|| format!("Couldn't bind mount \"{}\"", bm.source))?;
    }

    for dev_path in DEV_BINDS.iter() {
        let path = PathBuf::from(dev_path);
        bind_mount(root, &path, &path, false)
            .with_context(|| format!("Couldn't bind mount dev path \"{dev_path}\""))?;
    }

    Ok(())
}

pub fn chroot_into(new_root: &Path) -> Result {
    std::env::set_current_dir(new_root).context("Couldn't set current directory to new root")?;
    nix::unistd::chroot(new_root).context("Couldn't chroot to new root")?;
    std::env::set_current_dir("/").context("Couldn't set current directory to /")
}
