//! Parsing of provider credential files stored in secrets

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// One profile of an AWS shared credentials file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AwsProfile {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub role_arn: Option<String>,
    pub web_identity_token_file: Option<String>,
    pub sts_regional_endpoints: Option<String>,
}

impl AwsProfile {
    /// Static key pair, required for signing requests directly
    pub fn static_keys(&self) -> Option<(&str, &str)> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) => Some((id.as_str(), secret.as_str())),
            _ => None,
        }
    }
}

/// Parse the INI-formatted AWS credentials file and pick a profile.
///
/// Accepts both `[name]` and `[profile name]` section headers.
pub fn parse_aws_credentials(contents: &str, profile: &str) -> Result<AwsProfile> {
    let sections = parse_ini(contents);
    let values = sections
        .get(profile)
        .ok_or_else(|| Error::config(format!("profile {profile:?} not found in AWS credentials")))?;
    let get = |k: &str| values.get(k).cloned();
    Ok(AwsProfile {
        access_key_id: get("aws_access_key_id"),
        secret_access_key: get("aws_secret_access_key"),
        session_token: get("aws_session_token"),
        role_arn: get("role_arn"),
        web_identity_token_file: get("web_identity_token_file"),
        sts_regional_endpoints: get("sts_regional_endpoints"),
    })
}

fn parse_ini(contents: &str) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut current: Option<String> = None;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = header.trim();
            let name = name.strip_prefix("profile ").unwrap_or(name).trim();
            sections.entry(name.to_string()).or_default();
            current = Some(name.to_string());
            continue;
        }
        if let (Some(section), Some((k, v))) = (&current, line.split_once('=')) {
            if let Some(values) = sections.get_mut(section) {
                values.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }
    sections
}

/// Parse an env-style Azure credentials block (`KEY=value` per line)
pub fn parse_azure_credentials(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Whether a credential body describes a short-term-token flow
pub fn is_sts_content(contents: &str) -> bool {
    contents.contains("web_identity_token_file")
        || contents.contains("\"external_account\"")
        || contents.contains("AZURE_FEDERATED_TOKEN_FILE")
}
