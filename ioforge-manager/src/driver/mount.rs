use ioforge_common::model::{CephConnection, CephfsMountMethod, FilesystemType, MountConfig};

use super::DriverError;

/// Build the backend-specific mount command for a prepared mount point.
pub fn build_mount_command(
    mount: &MountConfig,
    ceph: Option<&CephConnection>,
) -> Result<String, DriverError> {
    match mount.filesystem {
        FilesystemType::Cephfs => Ok(build_cephfs_mount(mount, ceph)),
        FilesystemType::Nfs => build_nfs_mount(mount),
        FilesystemType::Glusterfs => build_gluster_mount(mount),
    }
}

/// Kernel mount extracts the key from the keyring on the worker itself, since
/// newer kernels no longer accept `secretfile=`.
fn build_cephfs_mount(mount: &MountConfig, ceph: Option<&CephConnection>) -> String {
    let user = &mount.cephfs_user;
    let monitors = ceph
        .map(|c| c.formatted_monitors())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| vec!["localhost:6789".to_string()]);
    let mon_str = monitors.join(",");
    let secret_file = mount
        .cephfs_secret_file
        .clone()
        .unwrap_or_else(|| format!("/etc/ceph/ceph.client.{user}.keyring"));

    match mount.mount_method {
        CephfsMountMethod::Fuse => {
            let mut cmd = format!("ceph-fuse --id {user} -k {secret_file} -m {mon_str}");
            if mount.cephfs_path != "/" && !mount.cephfs_path.is_empty() {
                cmd.push_str(&format!(" -r {}", mount.cephfs_path));
            }
            cmd.push_str(&format!(" {}", mount.mount_point));
            cmd
        }
        CephfsMountMethod::Kernel => {
            let device = format!("{mon_str}:{}", mount.cephfs_path);
            let extra = if mount.mount_options.is_empty() {
                String::new()
            } else {
                format!(",{}", mount.mount_options)
            };
            format!(
                "SECRET=$(ceph-authtool {secret_file} -n client.{user} -p 2>/dev/null || \
                 grep -A1 'client.{user}' {secret_file} | grep key | awk '{{print $3}}') && \
                 mount -t ceph {device} {mount_point} -o name={user},secret=$SECRET{extra}",
                mount_point = mount.mount_point,
            )
        }
    }
}

fn build_nfs_mount(mount: &MountConfig) -> Result<String, DriverError> {
    let server = mount
        .nfs_server
        .as_deref()
        .ok_or_else(|| DriverError::Mount("nfs mount requires a server".to_string()))?;
    let export = mount
        .nfs_export
        .as_deref()
        .ok_or_else(|| DriverError::Mount("nfs mount requires an export path".to_string()))?;

    let mut options = vec![format!("vers={}", mount.nfs_version)];
    if !mount.mount_options.is_empty() {
        options.push(mount.mount_options.clone());
    }
    Ok(format!(
        "mount -t nfs -o {} {server}:{export} {}",
        options.join(","),
        mount.mount_point
    ))
}

fn build_gluster_mount(mount: &MountConfig) -> Result<String, DriverError> {
    let volume = mount
        .gluster_volume
        .as_deref()
        .ok_or_else(|| DriverError::Mount("glusterfs mount requires a volume".to_string()))?;
    let server = mount
        .gluster_servers
        .first()
        .ok_or_else(|| DriverError::Mount("glusterfs mount requires at least one server".to_string()))?;

    let mut options = Vec::new();
    if mount.gluster_servers.len() > 1 {
        options.push(format!(
            "backup-volfile-servers={}",
            mount.gluster_servers[1..].join(",")
        ));
    }
    if !mount.mount_options.is_empty() {
        options.push(mount.mount_options.clone());
    }
    let opts = if options.is_empty() {
        String::new()
    } else {
        format!(" -o {}", options.join(","))
    };
    Ok(format!(
        "mount -t glusterfs{opts} {server}:/{volume} {}",
        mount.mount_point
    ))
}
