//! Container image selection for managed components

use std::collections::BTreeMap;

use crate::config::OperatorEnv;
use crate::crd::{DataProtectionApplicationSpec, DefaultPlugin};

/// Suffixes of the `RELATED_IMAGE_*` environment variables
pub const RELATED_IMAGE_KEYS: &[&str] = &[
    "VELERO",
    "OPENSHIFT_VELERO_PLUGIN",
    "VELERO_PLUGIN_FOR_AWS",
    "VELERO_PLUGIN_FOR_LEGACY_AWS",
    "VELERO_PLUGIN_FOR_MICROSOFT_AZURE",
    "VELERO_PLUGIN_FOR_GCP",
    "VELERO_PLUGIN_FOR_CSI",
    "KUBEVIRT_VELERO_PLUGIN",
    "HYPERSHIFT_VELERO_PLUGIN",
    "VELERO_RESTIC_RESTORE_HELPER",
    "REGISTRY",
    "NON_ADMIN_CONTROLLER",
];

/// `unsupportedOverrides` key selecting the operator flavour
pub const OPERATOR_TYPE_KEY: &str = "operator-type";
pub const OPERATOR_TYPE_MTC: &str = "mtc";

/// Images the operator can place in managed pods
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageKey {
    Velero,
    OpenShiftPlugin,
    AwsPlugin,
    LegacyAwsPlugin,
    AzurePlugin,
    GcpPlugin,
    CsiPlugin,
    KubeVirtPlugin,
    HypershiftPlugin,
    ResticRestoreHelper,
    Registry,
    NonAdminController,
}

impl ImageKey {
    pub const ALL: &'static [ImageKey] = &[
        ImageKey::Velero,
        ImageKey::OpenShiftPlugin,
        ImageKey::AwsPlugin,
        ImageKey::LegacyAwsPlugin,
        ImageKey::AzurePlugin,
        ImageKey::GcpPlugin,
        ImageKey::CsiPlugin,
        ImageKey::KubeVirtPlugin,
        ImageKey::HypershiftPlugin,
        ImageKey::ResticRestoreHelper,
        ImageKey::Registry,
        ImageKey::NonAdminController,
    ];

    /// Key accepted in `spec.unsupportedOverrides`
    pub fn override_key(&self) -> &'static str {
        match self {
            ImageKey::Velero => "veleroImageFqin",
            ImageKey::OpenShiftPlugin => "openshiftPluginImageFqin",
            ImageKey::AwsPlugin => "awsPluginImageFqin",
            ImageKey::LegacyAwsPlugin => "legacyAWSPluginImageFqin",
            ImageKey::AzurePlugin => "azurePluginImageFqin",
            ImageKey::GcpPlugin => "gcpPluginImageFqin",
            ImageKey::CsiPlugin => "csiPluginImageFqin",
            ImageKey::KubeVirtPlugin => "kubevirtPluginImageFqin",
            ImageKey::HypershiftPlugin => "hypershiftPluginImageFqin",
            ImageKey::ResticRestoreHelper => "resticRestoreImageFqin",
            ImageKey::Registry => "registryImageFqin",
            ImageKey::NonAdminController => "nonAdminControllerImageFqin",
        }
    }

    fn related_image(&self) -> &'static str {
        match self {
            ImageKey::Velero => "VELERO",
            ImageKey::OpenShiftPlugin => "OPENSHIFT_VELERO_PLUGIN",
            ImageKey::AwsPlugin => "VELERO_PLUGIN_FOR_AWS",
            ImageKey::LegacyAwsPlugin => "VELERO_PLUGIN_FOR_LEGACY_AWS",
            ImageKey::AzurePlugin => "VELERO_PLUGIN_FOR_MICROSOFT_AZURE",
            ImageKey::GcpPlugin => "VELERO_PLUGIN_FOR_GCP",
            ImageKey::CsiPlugin => "VELERO_PLUGIN_FOR_CSI",
            ImageKey::KubeVirtPlugin => "KUBEVIRT_VELERO_PLUGIN",
            ImageKey::HypershiftPlugin => "HYPERSHIFT_VELERO_PLUGIN",
            ImageKey::ResticRestoreHelper => "VELERO_RESTIC_RESTORE_HELPER",
            ImageKey::Registry => "REGISTRY",
            ImageKey::NonAdminController => "NON_ADMIN_CONTROLLER",
        }
    }

    fn default_image(&self) -> &'static str {
        match self {
            ImageKey::Velero => "quay.io/konveyor/velero:konveyor-1.7.0",
            ImageKey::OpenShiftPlugin => "quay.io/konveyor/openshift-velero-plugin:oadp-0.3.0",
            ImageKey::AwsPlugin | ImageKey::LegacyAwsPlugin => {
                "quay.io/konveyor/velero-plugin-for-aws:konveyor-1.3.0"
            }
            ImageKey::AzurePlugin => {
                "quay.io/konveyor/velero-plugin-for-microsoft-azure:konveyor-1.3.0"
            }
            ImageKey::GcpPlugin => "quay.io/konveyor/velero-plugin-for-gcp:konveyor-1.3.0",
            ImageKey::CsiPlugin => "quay.io/konveyor/velero-plugin-for-csi:konveyor-0.2.0",
            ImageKey::KubeVirtPlugin => "quay.io/konveyor/kubevirt-velero-plugin:v0.7.0",
            ImageKey::HypershiftPlugin => "quay.io/konveyor/hypershift-velero-plugin:main",
            ImageKey::ResticRestoreHelper => {
                "quay.io/konveyor/velero-restic-restore-helper:konveyor-1.7.0"
            }
            ImageKey::Registry => "quay.io/konveyor/registry:oadp-0.3.0",
            ImageKey::NonAdminController => "quay.io/konveyor/oadp-non-admin:latest",
        }
    }

    /// Image key of a built-in plugin
    pub fn for_plugin(plugin: DefaultPlugin) -> Option<ImageKey> {
        match plugin {
            DefaultPlugin::Aws => Some(ImageKey::AwsPlugin),
            DefaultPlugin::LegacyAws => Some(ImageKey::LegacyAwsPlugin),
            DefaultPlugin::Gcp => Some(ImageKey::GcpPlugin),
            DefaultPlugin::Azure => Some(ImageKey::AzurePlugin),
            DefaultPlugin::Csi => Some(ImageKey::CsiPlugin),
            DefaultPlugin::OpenShift => Some(ImageKey::OpenShiftPlugin),
            DefaultPlugin::KubeVirt => Some(ImageKey::KubeVirtPlugin),
            DefaultPlugin::Hypershift => Some(ImageKey::HypershiftPlugin),
            DefaultPlugin::Vsm => None,
        }
    }
}

/// Pick the image for a key: `unsupportedOverrides` beats `RELATED_IMAGE_*`
/// beats the built-in default.
pub fn resolve_image(
    key: ImageKey,
    env: &OperatorEnv,
    overrides: &BTreeMap<String, String>,
) -> String {
    overrides
        .get(key.override_key())
        .filter(|v| !v.is_empty())
        .or_else(|| env.related_images.get(key.related_image()))
        .cloned()
        .unwrap_or_else(|| key.default_image().to_string())
}

/// Every image resolved once for a reconcile
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Images {
    images: BTreeMap<ImageKey, String>,
}

impl Images {
    pub fn resolve(spec: &DataProtectionApplicationSpec, env: &OperatorEnv) -> Self {
        Self {
            images: ImageKey::ALL
                .iter()
                .map(|k| (*k, resolve_image(*k, env, &spec.unsupported_overrides)))
                .collect(),
        }
    }

    pub fn get(&self, key: ImageKey) -> &str {
        self.images
            .get(&key)
            .map(String::as_str)
            .unwrap_or_else(|| key.default_image())
    }
}

/// Pull policy for an image: digests are immutable so the cached copy is
/// fine, tags may move.
pub fn image_pull_policy(spec: &DataProtectionApplicationSpec, image: &str) -> String {
    if let Some(policy) = &spec.image_pull_policy {
        return policy.clone();
    }
    if image.contains("@sha256:") {
        "IfNotPresent".to_string()
    } else {
        "Always".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_beats_related_image_beats_default() {
        let mut env = OperatorEnv::default();
        assert_eq!(
            resolve_image(ImageKey::Velero, &env, &BTreeMap::new()),
            "quay.io/konveyor/velero:konveyor-1.7.0"
        );

        env.related_images.insert("VELERO".into(), "registry.local/velero:1".into());
        assert_eq!(
            resolve_image(ImageKey::Velero, &env, &BTreeMap::new()),
            "registry.local/velero:1"
        );

        let overrides = BTreeMap::from([("veleroImageFqin".to_string(), "mine/velero:x".to_string())]);
        assert_eq!(resolve_image(ImageKey::Velero, &env, &overrides), "mine/velero:x");
    }

    #[test]
    fn legacy_aws_shares_the_aws_image() {
        let env = OperatorEnv::default();
        assert_eq!(
            resolve_image(ImageKey::LegacyAwsPlugin, &env, &BTreeMap::new()),
            resolve_image(ImageKey::AwsPlugin, &env, &BTreeMap::new())
        );
    }

    #[test]
    fn digests_are_pulled_if_not_present() {
        let spec = DataProtectionApplicationSpec::default();
        assert_eq!(image_pull_policy(&spec, "quay.io/x@sha256:abc"), "IfNotPresent");
        assert_eq!(image_pull_policy(&spec, "quay.io/x:latest"), "Always");

        let spec = DataProtectionApplicationSpec {
            image_pull_policy: Some("Never".into()),
            ..Default::default()
        };
        assert_eq!(image_pull_policy(&spec, "quay.io/x:latest"), "Never");
    }
}
