use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use super::ModelError;

/// The broad storage category a cluster (and the workloads targeting it)
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFamily {
    Block,
    File,
    Object,
}

impl Display for StorageFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StorageFamily::Block => "block",
            StorageFamily::File => "file",
            StorageFamily::Object => "object",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    CephRbd,
    Cephfs,
    Nfs,
    Glusterfs,
    S3,
}

impl StorageBackend {
    pub fn is_ceph(&self) -> bool {
        matches!(self, StorageBackend::CephRbd | StorageBackend::Cephfs)
    }
}

impl Display for StorageBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StorageBackend::CephRbd => "ceph_rbd",
            StorageBackend::Cephfs => "cephfs",
            StorageBackend::Nfs => "nfs",
            StorageBackend::Glusterfs => "glusterfs",
            StorageBackend::S3 => "s3",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CephConnection {
    pub monitors: Vec<String>,
    #[serde(default = "default_ceph_user")]
    pub user: String,
    #[serde(default = "default_keyring_path")]
    pub keyring_path: String,
    #[serde(default = "default_conf_path")]
    pub conf_path: String,
    #[serde(default)]
    pub pool: Option<String>,
    /// Package repository used to install ceph-common on workers, if needed.
    #[serde(default)]
    pub repo_url: Option<String>,
}

fn default_ceph_user() -> String {
    "admin".to_string()
}

fn default_keyring_path() -> String {
    "/etc/ceph/ceph.client.admin.keyring".to_string()
}

fn default_conf_path() -> String {
    "/etc/ceph/ceph.conf".to_string()
}

impl CephConnection {
    /// Monitor list with the default messenger port filled in where missing.
    pub fn formatted_monitors(&self) -> Vec<String> {
        self.monitors
            .iter()
            .map(|m| {
                if m.contains(':') {
                    m.clone()
                } else {
                    format!("{m}:6789")
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NfsConnection {
    pub server: String,
    pub export_path: String,
    #[serde(default = "default_nfs_options")]
    pub mount_options: String,
}

fn default_nfs_options() -> String {
    "rw,sync,hard".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Connection {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Node used to run cluster CLI tools (`ceph status`, credential fetches).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminNode {
    pub host: String,
    #[serde(default = "default_admin_user")]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_admin_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterConnection<'a> {
    Ceph(&'a CephConnection),
    Nfs(&'a NfsConnection),
    S3(&'a S3Connection),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub storage_family: StorageFamily,
    pub backend: StorageBackend,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ceph: Option<CephConnection>,
    #[serde(default)]
    pub nfs: Option<NfsConnection>,
    #[serde(default)]
    pub s3: Option<S3Connection>,
    #[serde(default)]
    pub admin_node: Option<AdminNode>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ClusterConfig {
    /// The connection block matching the configured backend.
    pub fn connection(&self) -> Result<ClusterConnection<'_>, ModelError> {
        match self.backend {
            StorageBackend::CephRbd | StorageBackend::Cephfs => self
                .ceph
                .as_ref()
                .map(ClusterConnection::Ceph)
                .ok_or(ModelError::MissingConnection("ceph")),
            StorageBackend::Nfs | StorageBackend::Glusterfs => self
                .nfs
                .as_ref()
                .map(ClusterConnection::Nfs)
                .ok_or(ModelError::MissingConnection("nfs")),
            StorageBackend::S3 => self
                .s3
                .as_ref()
                .map(ClusterConnection::S3)
                .ok_or(ModelError::MissingConnection("s3")),
        }
    }

    /// Exactly one connection block must be populated and it must match the
    /// backend.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.trim().is_empty() {
            return Err(ModelError::invalid("cluster", "name must not be empty"));
        }
        let populated =
            self.ceph.is_some() as usize + self.nfs.is_some() as usize + self.s3.is_some() as usize;
        if populated != 1 {
            return Err(ModelError::invalid(
                "cluster",
                format!("expected exactly one connection block, found {populated}"),
            ));
        }
        self.connection()?;
        if let Some(ceph) = &self.ceph {
            if ceph.monitors.is_empty() {
                return Err(ModelError::invalid("cluster", "ceph monitor list is empty"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn ceph_cluster() -> ClusterConfig {
        ClusterConfig {
            name: "lab".to_string(),
            storage_family: StorageFamily::File,
            backend: StorageBackend::Cephfs,
            description: None,
            ceph: Some(CephConnection {
                monitors: vec!["mon-a".to_string(), "mon-b:3300".to_string()],
                user: default_ceph_user(),
                keyring_path: default_keyring_path(),
                conf_path: default_conf_path(),
                pool: None,
                repo_url: None,
            }),
            nfs: None,
            s3: None,
            admin_node: None,
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn exactly_one_connection_is_required() {
        let mut cluster = ceph_cluster();
        assert!(cluster.validate().is_ok());

        cluster.nfs = Some(NfsConnection {
            server: "nfs-1".to_string(),
            export_path: "/export".to_string(),
            mount_options: default_nfs_options(),
        });
        assert!(cluster.validate().is_err());

        cluster.nfs = None;
        cluster.ceph = None;
        assert!(cluster.validate().is_err());
    }

    #[test]
    fn monitors_get_default_port() {
        let cluster = ceph_cluster();
        let mons = cluster.ceph.unwrap().formatted_monitors();
        assert_eq!(mons, vec!["mon-a:6789", "mon-b:3300"]);
    }

    #[test]
    fn connection_must_match_backend() {
        let mut cluster = ceph_cluster();
        cluster.backend = StorageBackend::Nfs;
        assert!(matches!(
            cluster.validate(),
            Err(ModelError::MissingConnection("nfs"))
        ));
    }
}
