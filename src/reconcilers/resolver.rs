//! Backend-config resolution.
//!
//! Turns a validated DataProtectionApplication plus the objects it
//! references into per-location descriptors: effective provider config,
//! credential mounts, the plugin set and Velero feature flags. Everything
//! here is a pure function of its inputs so builders see identical input
//! for identical specs.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;

use crate::adapters::credentials::{parse_aws_credentials, parse_azure_credentials};
use crate::adapters::{get_secret_string, is_sts_secret};
use crate::config::OperatorEnv;
use crate::crd::velero::{BackupStorageLocationSpec, ObjectStorageLocation, VolumeSnapshotLocationSpec};
use crate::crd::{
    BackupLocation, CloudStorage, CredentialRef, CustomPlugin, DataProtectionApplication,
    DefaultPlugin,
};
use crate::error::{Error, Result};
use crate::store::{get_as, list_as, ClusterStore, ObjectKey, ResourceKind};

use super::images::Images;

/// Root under which location credentials are mounted in the Velero pod
pub const CREDENTIALS_ROOT: &str = "/credentials";

/// Feature flag that disables credential secret checks
pub const NO_SECRET_FLAG: &str = "no-secret";
pub const FLAG_ENABLE_CSI: &str = "EnableCSI";
pub const FLAG_API_GROUP_VERSIONS: &str = "EnableAPIGroupVersions";

/// Key used in user-provided credential secrets
pub const DEFAULT_CREDENTIAL_KEY: &str = "cloud";

/// Per-provider secret naming and the env var the plugin reads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProviderDefaults {
    pub secret_name: &'static str,
    /// Key written by short-term-token bootstrap
    pub sts_key: &'static str,
    pub env_var: &'static str,
}

pub fn provider_defaults(provider: &str) -> Option<ProviderDefaults> {
    match provider {
        "aws" => Some(ProviderDefaults {
            secret_name: "cloud-credentials",
            sts_key: "credentials",
            env_var: "AWS_SHARED_CREDENTIALS_FILE",
        }),
        "gcp" => Some(ProviderDefaults {
            secret_name: "cloud-credentials-gcp",
            sts_key: "service_account.json",
            env_var: "GOOGLE_APPLICATION_CREDENTIALS",
        }),
        "azure" => Some(ProviderDefaults {
            secret_name: "cloud-credentials-azure",
            sts_key: "azurekey",
            env_var: "AZURE_CREDENTIALS_FILE",
        }),
        _ => None,
    }
}

/// Cluster objects a DPA depends on, read before validation
#[derive(Clone, Debug, Default)]
pub struct ObservedInputs {
    /// CloudStorages in the DPA namespace by name
    pub cloud_storages: BTreeMap<String, CloudStorage>,
    /// Referenced secrets by name; absent ones are simply missing
    pub secrets: BTreeMap<String, Secret>,
    /// An older DPA in the same namespace, if any
    pub older_dpa: Option<String>,
}

impl ObservedInputs {
    /// Read everything `dpa` references from the store
    pub async fn fetch(store: &dyn ClusterStore, dpa: &DataProtectionApplication) -> Result<Self> {
        let namespace = dpa.namespace().unwrap_or_default();

        let cloud_storages: BTreeMap<String, CloudStorage> =
            list_as::<CloudStorage>(store, ResourceKind::CloudStorage, Some(&namespace))
                .await?
                .into_iter()
                .map(|cs| (cs.name_any(), cs))
                .collect();

        let mut names: BTreeSet<String> = BTreeSet::new();
        for location in &dpa.spec.backup_locations {
            if let Some(bsl) = &location.velero {
                if let Some(c) = &bsl.credential {
                    names.insert(c.name.clone());
                } else if let Some(d) = provider_defaults(&bsl.provider) {
                    names.insert(d.secret_name.to_string());
                }
            }
            if let Some(bucket) = &location.bucket {
                if let Some(c) = &bucket.credential {
                    names.insert(c.name.clone());
                } else if let Some(cs) = cloud_storages.get(&bucket.cloud_storage_ref.name) {
                    names.insert(cs.spec.creation_secret.name.clone());
                }
            }
        }
        for location in &dpa.spec.snapshot_locations {
            if let Some(c) = &location.velero.credential {
                names.insert(c.name.clone());
            } else if let Some(d) = provider_defaults(&location.velero.provider) {
                names.insert(d.secret_name.to_string());
            }
        }

        let mut secrets = BTreeMap::new();
        for name in names {
            let key = ObjectKey::namespaced(ResourceKind::Secret, &namespace, &name);
            if let Some(secret) = get_as::<Secret>(store, &key).await? {
                secrets.insert(name, secret);
            }
        }

        let older_dpa = list_as::<DataProtectionApplication>(
            store,
            ResourceKind::DataProtectionApplication,
            Some(&namespace),
        )
        .await?
        .into_iter()
        .filter(|other| other.name_any() != dpa.name_any())
        .filter(|other| is_older(other, dpa))
        .map(|other| other.name_any())
        .min();

        Ok(Self {
            cloud_storages,
            secrets,
            older_dpa,
        })
    }
}

fn is_older(a: &DataProtectionApplication, b: &DataProtectionApplication) -> bool {
    let ta = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let tb = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
    match (ta, tb) {
        (Some(ta), Some(tb)) if ta != tb => ta < tb,
        _ => a.name_any() < b.name_any(),
    }
}

/// Where a location's credential secret is mounted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialMount {
    pub secret_name: String,
    pub key: String,
    pub mount_path: String,
    pub volume_name: String,
}

impl CredentialMount {
    fn for_location(location: &str, credential: &CredentialRef) -> Self {
        Self {
            secret_name: credential.name.clone(),
            key: credential.key.clone(),
            mount_path: format!("{CREDENTIALS_ROOT}/{location}"),
            volume_name: format!("{location}-credentials"),
        }
    }

    /// Snapshot-location mounts live beside backup-location ones under a `vsl-` prefix
    fn for_snapshot_location(location: &str, credential: &CredentialRef) -> Self {
        Self {
            secret_name: credential.name.clone(),
            key: credential.key.clone(),
            mount_path: format!("{CREDENTIALS_ROOT}/vsl-{location}"),
            volume_name: format!("{location}-vsl-credentials"),
        }
    }

    /// Path of the credential file inside the pod
    pub fn file_path(&self) -> String {
        format!("{}/{}", self.mount_path, self.key)
    }
}

/// Storage configuration handed to the internal registry of one location
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistryStorage {
    /// Literal environment
    pub env: Vec<(String, String)>,
    /// Contents of the `<bsl>-registry-secret`
    pub secret_data: BTreeMap<String, String>,
    /// Env vars sourced from the registry secret: (env name, secret key)
    pub secret_env: Vec<(String, String)>,
    /// Location credential mounted directly into the registry pod
    pub credential_mount: Option<CredentialMount>,
}

/// Fully resolved backup location
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedLocation {
    pub name: String,
    pub spec: BackupStorageLocationSpec,
    pub credential: Option<CredentialMount>,
    pub sts: bool,
    pub required_plugins: BTreeSet<DefaultPlugin>,
    pub registry: Option<RegistryStorage>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedSnapshotLocation {
    pub name: String,
    pub spec: VolumeSnapshotLocationSpec,
    pub credential: Option<CredentialMount>,
}

/// Descriptor set consumed by the child builders
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedDpa {
    pub name: String,
    pub namespace: String,
    pub locations: Vec<ResolvedLocation>,
    pub snapshot_locations: Vec<ResolvedSnapshotLocation>,
    pub plugins: BTreeSet<DefaultPlugin>,
    pub custom_plugins: Vec<CustomPlugin>,
    pub feature_flags: BTreeSet<String>,
    /// Provider env vars pointing at the first mounted credential of each provider
    pub provider_env: BTreeMap<String, String>,
    pub ca_bundle: Option<String>,
    /// Contents of the API group versions ConfigMap
    pub restore_version_priority: Option<String>,
    /// Any location uses short-term-token credentials
    pub sts: bool,
    pub images: Images,
}

impl ResolvedDpa {
    /// Credential mounts of every location, deduplicated by volume
    pub fn credential_mounts(&self) -> Vec<&CredentialMount> {
        let mut seen = BTreeSet::new();
        self.locations
            .iter()
            .filter_map(|l| l.credential.as_ref())
            .chain(self.snapshot_locations.iter().filter_map(|l| l.credential.as_ref()))
            .filter(|m| seen.insert(m.volume_name.clone()))
            .collect()
    }
}

/// Name of the BSL created for `backupLocations[index]`
pub fn location_name(dpa_name: &str, index: usize, explicit: Option<&String>) -> String {
    match explicit {
        Some(name) if !name.is_empty() => name.clone(),
        _ => format!("{dpa_name}-{}", index + 1),
    }
}

/// Resolve a validated DPA into builder input
pub fn resolve(
    dpa: &DataProtectionApplication,
    observed: &ObservedInputs,
    env: &OperatorEnv,
) -> Result<ResolvedDpa> {
    let name = dpa.name_any();
    let namespace = dpa.namespace().unwrap_or_default();
    let spec = &dpa.spec;
    let velero = spec
        .velero()
        .ok_or_else(|| Error::internal("resolve called without velero configuration"))?;
    let check_secrets = !velero.feature_flags.iter().any(|f| f == NO_SECRET_FLAG);

    let mut locations = Vec::with_capacity(spec.backup_locations.len());
    for (i, location) in spec.backup_locations.iter().enumerate() {
        let loc_name = location_name(&name, i, location.name.as_ref());
        let bsl = effective_bsl(location, observed)?;
        let credential = credential_for(&bsl.provider, bsl.credential.as_ref(), observed);
        let sts = credential
            .as_ref()
            .and_then(|c| observed.secrets.get(&c.name))
            .map(is_sts_secret)
            .unwrap_or(false);
        if check_secrets {
            if let Some(c) = &credential {
                require_secret_key(observed, &namespace, c)?;
            }
        }

        let mount = credential.as_ref().map(|c| CredentialMount::for_location(&loc_name, c));
        let mut bsl = bsl;
        bsl.credential = credential.clone();
        if bsl.provider == "aws" {
            bsl.config
                .entry("checksumAlgorithm".to_string())
                .or_default();
        }
        if bsl.provider == "gcp" && sts {
            if let Some(m) = &mount {
                bsl.config.insert("credentialsFile".to_string(), m.file_path());
            }
        }

        let registry = if spec.backup_images() && !sts {
            match (&credential, observed_secret_body(observed, credential.as_ref())) {
                (Some(_), Some(body)) => registry_storage(&bsl, &body, mount.as_ref())?,
                _ => None,
            }
        } else {
            None
        };

        locations.push(ResolvedLocation {
            name: loc_name,
            required_plugins: provider_plugins(&bsl.provider, &velero.default_plugins),
            spec: bsl,
            credential: mount,
            sts,
            registry,
        });
    }

    let mut snapshot_locations = Vec::with_capacity(spec.snapshot_locations.len());
    for (i, location) in spec.snapshot_locations.iter().enumerate() {
        let loc_name = location_name(&name, i, location.name.as_ref());
        let mut vsl = location.velero.clone();
        let credential = credential_for(&vsl.provider, vsl.credential.as_ref(), observed);
        if check_secrets {
            if let Some(c) = &credential {
                require_secret_key(observed, &namespace, c)?;
            }
        }
        vsl.credential = credential.clone();
        snapshot_locations.push(ResolvedSnapshotLocation {
            credential: credential
                .as_ref()
                .map(|c| CredentialMount::for_snapshot_location(&loc_name, c)),
            name: loc_name,
            spec: vsl,
        });
    }

    let mut plugins: BTreeSet<DefaultPlugin> = velero
        .default_plugins
        .iter()
        .copied()
        .filter(|p| *p != DefaultPlugin::Vsm)
        .collect();
    for location in &locations {
        plugins.extend(location.required_plugins.iter().copied());
    }
    for location in &snapshot_locations {
        plugins.extend(provider_plugins(&location.spec.provider, &velero.default_plugins));
    }
    if spec.data_mover_enabled() || velero.default_snapshot_move_data.unwrap_or(false) {
        plugins.insert(DefaultPlugin::Csi);
    }

    let mut feature_flags: BTreeSet<String> = velero
        .feature_flags
        .iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();
    if plugins.contains(&DefaultPlugin::Csi) {
        feature_flags.insert(FLAG_ENABLE_CSI.to_string());
    }
    let restore_version_priority = velero
        .restore_resources_version_priority
        .clone()
        .filter(|p| !p.is_empty());
    if restore_version_priority.is_some() {
        feature_flags.insert(FLAG_API_GROUP_VERSIONS.to_string());
    }

    let mut provider_env = BTreeMap::new();
    let mounts = locations
        .iter()
        .filter_map(|l| l.credential.as_ref().map(|m| (l.spec.provider.as_str(), m)))
        .chain(
            snapshot_locations
                .iter()
                .filter_map(|l| l.credential.as_ref().map(|m| (l.spec.provider.as_str(), m))),
        );
    for (provider, mount) in mounts {
        if let Some(d) = provider_defaults(provider) {
            provider_env
                .entry(d.env_var.to_string())
                .or_insert_with(|| mount.file_path());
        }
    }

    let certs: Vec<String> = locations
        .iter()
        .filter_map(|l| l.spec.object_storage.ca_cert.as_ref())
        .map(|c| String::from_utf8_lossy(&c.0).trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    let ca_bundle = if certs.is_empty() {
        None
    } else {
        Some(format!("{}\n", certs.join("\n")))
    };

    Ok(ResolvedDpa {
        sts: locations.iter().any(|l| l.sts),
        name,
        namespace,
        locations,
        snapshot_locations,
        plugins,
        custom_plugins: velero.custom_plugins.clone(),
        feature_flags,
        provider_env,
        ca_bundle,
        restore_version_priority,
        images: Images::resolve(spec, env),
    })
}

/// Inline BSL, or the equivalent BSL for a CloudStorage reference
fn effective_bsl(location: &BackupLocation, observed: &ObservedInputs) -> Result<BackupStorageLocationSpec> {
    if let Some(bsl) = &location.velero {
        return Ok(bsl.clone());
    }
    let bucket = location
        .bucket
        .as_ref()
        .ok_or_else(|| Error::internal("backup location without velero or bucket"))?;
    let cs = observed
        .cloud_storages
        .get(&bucket.cloud_storage_ref.name)
        .ok_or_else(|| {
            Error::dependency(format!("CloudStorage {} not found", bucket.cloud_storage_ref.name))
        })?;

    let mut config = bucket.config.clone();
    config
        .entry("region".to_string())
        .or_insert_with(|| cs.spec.region.clone());
    if cs.spec.enable_shared_config.unwrap_or(false) {
        config.insert("enableSharedConfig".to_string(), "true".to_string());
    }
    Ok(BackupStorageLocationSpec {
        provider: cs.spec.provider.as_str().to_string(),
        object_storage: ObjectStorageLocation {
            bucket: cs.spec.name.clone(),
            prefix: bucket.prefix.clone(),
            ca_cert: bucket.ca_cert.clone(),
        },
        config,
        credential: bucket
            .credential
            .clone()
            .or_else(|| Some(cs.spec.creation_secret.clone())),
        default: bucket.default,
        backup_sync_period: bucket.backup_sync_period.clone(),
        ..Default::default()
    })
}

/// Explicit credential, else the provider's default secret
fn credential_for(
    provider: &str,
    explicit: Option<&CredentialRef>,
    observed: &ObservedInputs,
) -> Option<CredentialRef> {
    if let Some(c) = explicit {
        return Some(c.clone());
    }
    let defaults = provider_defaults(provider)?;
    let key = match observed.secrets.get(defaults.secret_name) {
        Some(secret) if is_sts_secret(secret) => defaults.sts_key,
        _ => DEFAULT_CREDENTIAL_KEY,
    };
    Some(CredentialRef {
        name: defaults.secret_name.to_string(),
        key: key.to_string(),
    })
}

fn require_secret_key(observed: &ObservedInputs, namespace: &str, c: &CredentialRef) -> Result<()> {
    let secret = observed.secrets.get(&c.name).ok_or_else(|| {
        Error::dependency(format!("credential secret {namespace}/{} not found", c.name))
    })?;
    get_secret_string(secret, &c.key)
        .map(|_| ())
        .map_err(|_| Error::dependency(format!("key {:?} not found in secret {namespace}/{}", c.key, c.name)))
}

fn observed_secret_body(observed: &ObservedInputs, c: Option<&CredentialRef>) -> Option<String> {
    let c = c?;
    observed
        .secrets
        .get(&c.name)
        .and_then(|s| get_secret_string(s, &c.key).ok())
}

/// Plugins a provider needs; `legacy-aws` satisfies aws locations
fn provider_plugins(provider: &str, declared: &[DefaultPlugin]) -> BTreeSet<DefaultPlugin> {
    let mut out = BTreeSet::new();
    match DefaultPlugin::for_provider(provider) {
        Some(DefaultPlugin::Aws) if declared.contains(&DefaultPlugin::LegacyAws) => {
            out.insert(DefaultPlugin::LegacyAws);
        }
        Some(p) => {
            out.insert(p);
        }
        None => {}
    }
    out
}

fn registry_storage(
    bsl: &BackupStorageLocationSpec,
    credentials: &str,
    mount: Option<&CredentialMount>,
) -> Result<Option<RegistryStorage>> {
    let config = |k: &str| bsl.config.get(k).cloned().filter(|v| !v.is_empty());
    let bucket = bsl.object_storage.bucket.clone();
    let prefix = bsl.object_storage.prefix.clone().unwrap_or_default();
    let mut storage = RegistryStorage::default();

    match bsl.provider.as_str() {
        "aws" => {
            let profile = config("profile").unwrap_or_else(|| "default".to_string());
            let parsed = parse_aws_credentials(credentials, &profile)
                .map_err(|e| Error::dependency(format!("registry credentials: {e}")))?;
            let (id, secret) = parsed.static_keys().ok_or_else(|| {
                Error::dependency(format!(
                    "registry credentials: profile {profile:?} has no access key pair"
                ))
            })?;
            storage.env = vec![
                ("REGISTRY_STORAGE".into(), "s3".into()),
                ("REGISTRY_STORAGE_S3_BUCKET".into(), bucket),
                (
                    "REGISTRY_STORAGE_S3_REGION".into(),
                    config("region").unwrap_or_else(|| "us-east-1".to_string()),
                ),
                ("REGISTRY_STORAGE_S3_ROOTDIRECTORY".into(), prefix),
            ];
            if let Some(url) = config("s3Url") {
                storage.env.push(("REGISTRY_STORAGE_S3_REGIONENDPOINT".into(), url));
            }
            if let Some(skip) = config("insecureSkipTLSVerify") {
                storage.env.push(("REGISTRY_STORAGE_S3_SKIPVERIFY".into(), skip));
            }
            storage.secret_data.insert("access_key".into(), id.to_string());
            storage.secret_data.insert("secret_key".into(), secret.to_string());
            storage.secret_env = vec![
                ("REGISTRY_STORAGE_S3_ACCESSKEY".into(), "access_key".into()),
                ("REGISTRY_STORAGE_S3_SECRETKEY".into(), "secret_key".into()),
            ];
        }
        "azure" => {
            let values = parse_azure_credentials(credentials);
            let key_var = config("storageAccountKeyEnvVar")
                .unwrap_or_else(|| "AZURE_STORAGE_ACCOUNT_ACCESS_KEY".to_string());
            storage.env = vec![
                ("REGISTRY_STORAGE".into(), "azure".into()),
                ("REGISTRY_STORAGE_AZURE_CONTAINER".into(), bucket),
                (
                    "REGISTRY_STORAGE_AZURE_ACCOUNTNAME".into(),
                    config("storageAccount").unwrap_or_default(),
                ),
            ];
            if let Some(key) = values.get(&key_var) {
                storage.secret_data.insert("storage_account_key".into(), key.clone());
                storage.secret_env.push((
                    "REGISTRY_STORAGE_AZURE_ACCOUNTKEY".into(),
                    "storage_account_key".into(),
                ));
            }
        }
        "gcp" => {
            let Some(mount) = mount else {
                return Ok(None);
            };
            let registry_mount = CredentialMount {
                mount_path: CREDENTIALS_ROOT.to_string(),
                ..mount.clone()
            };
            storage.env = vec![
                ("REGISTRY_STORAGE".into(), "gcs".into()),
                ("REGISTRY_STORAGE_GCS_BUCKET".into(), bucket),
                ("REGISTRY_STORAGE_GCS_ROOTDIRECTORY".into(), prefix),
                ("REGISTRY_STORAGE_GCS_KEYFILE".into(), registry_mount.file_path()),
            ];
            storage.credential_mount = Some(registry_mount);
        }
        _ => return Ok(None),
    }
    Ok(Some(storage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_names_are_one_based() {
        assert_eq!(location_name("dpa", 0, None), "dpa-1");
        assert_eq!(location_name("dpa", 2, None), "dpa-3");
        assert_eq!(location_name("dpa", 0, Some(&"main".to_string())), "main");
    }

    #[test]
    fn legacy_aws_replaces_aws_for_locations() {
        let plugins = provider_plugins("aws", &[DefaultPlugin::LegacyAws]);
        assert_eq!(plugins.into_iter().collect::<Vec<_>>(), vec![DefaultPlugin::LegacyAws]);
        assert!(provider_plugins("minio", &[]).is_empty());
    }

    #[test]
    fn credential_mount_paths() {
        let m = CredentialMount::for_location(
            "dpa-1",
            &CredentialRef {
                name: "cloud-credentials".into(),
                key: "cloud".into(),
            },
        );
        assert_eq!(m.file_path(), "/credentials/dpa-1/cloud");
        assert_eq!(m.volume_name, "dpa-1-credentials");
    }

    #[test]
    fn snapshot_mounts_do_not_share_backup_mount_names() {
        let credential = CredentialRef {
            name: "cloud-credentials-gcp".into(),
            key: "cloud".into(),
        };
        let bsl = CredentialMount::for_location("dpa-1", &credential);
        let vsl = CredentialMount::for_snapshot_location("dpa-1", &credential);
        assert_ne!(bsl.volume_name, vsl.volume_name);
        assert_eq!(vsl.volume_name, "dpa-1-vsl-credentials");
        assert_eq!(vsl.file_path(), "/credentials/vsl-dpa-1/cloud");
    }
}
