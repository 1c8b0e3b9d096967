//! S3 REST client signed with SigV4

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use reqwest::{Method, StatusCode, Url};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::sigv4::{self, SignableRequest, SigningCredentials};
use super::{ObjectStorage, ObjectStorageFactory, StorageTarget};
use crate::error::{Error, Result};

const US_EAST_1: &str = "us-east-1";

/// Path-style S3 client
pub struct S3Client {
    http: reqwest::Client,
    endpoint: Url,
    region: String,
    credentials: Option<SigningCredentials>,
}

impl S3Client {
    pub fn new(target: &StorageTarget) -> Result<Self> {
        let region = if target.region.is_empty() {
            US_EAST_1.to_string()
        } else {
            target.region.clone()
        };
        let endpoint = match &target.endpoint {
            Some(url) => url.clone(),
            None => format!("https://s3.{region}.amazonaws.com"),
        };
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| Error::config(format!("invalid s3Url {endpoint:?}: {e}")))?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(target.skip_tls_verify)
            .build()
            .map_err(|e| Error::provider(format!("building HTTP client: {e}")))?;
        let credentials = target
            .credentials
            .as_ref()
            .and_then(|p| {
                p.static_keys().map(|(id, secret)| SigningCredentials {
                    access_key_id: id.to_string(),
                    secret_access_key: secret.to_string(),
                    session_token: p.session_token.clone(),
                })
            });
        Ok(Self {
            http,
            endpoint,
            region,
            credentials,
        })
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    fn path(&self, bucket: Option<&str>, key: Option<&str>) -> String {
        let mut path = self.endpoint.path().trim_end_matches('/').to_string();
        if let Some(bucket) = bucket {
            path.push('/');
            path.push_str(&sigv4::uri_encode(bucket, false));
        }
        if let Some(key) = key {
            path.push('/');
            path.push_str(&sigv4::uri_encode(key, true));
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }

    async fn send(
        &self,
        method: Method,
        bucket: Option<&str>,
        key: Option<&str>,
        query: &[(String, String)],
        body: Vec<u8>,
        extra_headers: &[(String, String)],
    ) -> Result<reqwest::Response> {
        let host = self.host();
        let path = self.path(bucket, key);
        let query_string = sigv4::canonical_query(query);
        let url = if query_string.is_empty() {
            format!("{}://{}{}", self.endpoint.scheme(), host, path)
        } else {
            format!("{}://{}{}?{}", self.endpoint.scheme(), host, path, query_string)
        };

        let mut request = self.http.request(method.clone(), &url);
        let headers = match &self.credentials {
            Some(creds) => sigv4::sign(
                &SignableRequest {
                    method: method.as_str(),
                    host: &host,
                    path: &path,
                    query,
                    payload: &body,
                    extra_headers,
                },
                creds,
                &self.region,
                Utc::now(),
            )?,
            None => extra_headers.to_vec(),
        };
        for (k, v) in headers {
            request = request.header(k, v);
        }
        debug!(method = %method, url = %url, "S3 request");
        request
            .body(body)
            .send()
            .await
            .map_err(|e| Error::provider(format!("{method} {url}: {e}")))
    }

    async fn expect_success(response: reqwest::Response, what: &str) -> Result<String> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(body)
        } else {
            let code = xml_values(&body, "Code").into_iter().next().unwrap_or_default();
            Err(Error::provider(format!("{what}: HTTP {status} {code}")))
        }
    }
}

#[async_trait]
impl ObjectStorage for S3Client {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let response = self.send(Method::HEAD, Some(bucket), None, &[], Vec::new(), &[]).await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Error::provider(format!("head bucket {bucket}: HTTP {s}"))),
        }
    }

    async fn bucket_tags(&self, bucket: &str) -> Result<BTreeMap<String, String>> {
        let query = [("tagging".to_string(), String::new())];
        let response = self.send(Method::GET, Some(bucket), None, &query, Vec::new(), &[]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            // NoSuchTagSet
            return Ok(BTreeMap::new());
        }
        let body = Self::expect_success(response, &format!("get tags of {bucket}")).await?;
        Ok(parse_tags(&body))
    }

    async fn create_bucket(&self, bucket: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let body = if self.region == US_EAST_1 {
            Vec::new()
        } else {
            format!(
                "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                xml_escape(&self.region)
            )
            .into_bytes()
        };
        let response = self.send(Method::PUT, Some(bucket), None, &[], body, &[]).await?;
        Self::expect_success(response, &format!("create bucket {bucket}")).await?;

        if !tags.is_empty() {
            let tag_xml: String = tags
                .iter()
                .map(|(k, v)| {
                    format!(
                        "<Tag><Key>{}</Key><Value>{}</Value></Tag>",
                        xml_escape(k),
                        xml_escape(v)
                    )
                })
                .collect();
            let body = format!("<Tagging><TagSet>{tag_xml}</TagSet></Tagging>").into_bytes();
            let checksum = general_purpose::STANDARD.encode(Sha256::digest(&body));
            let headers = [("x-amz-checksum-sha256".to_string(), checksum)];
            let query = [("tagging".to_string(), String::new())];
            let response = self.send(Method::PUT, Some(bucket), None, &query, body, &headers).await?;
            Self::expect_success(response, &format!("tag bucket {bucket}")).await?;
        }
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let response = self.send(Method::DELETE, Some(bucket), None, &[], Vec::new(), &[]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::expect_success(response, &format!("delete bucket {bucket}")).await?;
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        let response = self.send(Method::PUT, Some(bucket), Some(key), &[], body, &[]).await?;
        Self::expect_success(response, &format!("put {bucket}/{key}")).await?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let response = self.send(Method::DELETE, Some(bucket), Some(key), &[], Vec::new(), &[]).await?;
        Self::expect_success(response, &format!("delete {bucket}/{key}")).await?;
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let query = [
            ("list-type".to_string(), "2".to_string()),
            ("max-keys".to_string(), "100".to_string()),
            ("prefix".to_string(), prefix.to_string()),
        ];
        let response = self.send(Method::GET, Some(bucket), None, &query, Vec::new(), &[]).await?;
        let body = Self::expect_success(response, &format!("list {bucket}/{prefix}")).await?;
        Ok(xml_values(&body, "Key"))
    }

    async fn bucket_versioning(&self, bucket: &str) -> Result<Option<String>> {
        let query = [("versioning".to_string(), String::new())];
        let response = self.send(Method::GET, Some(bucket), None, &query, Vec::new(), &[]).await?;
        let body = Self::expect_success(response, &format!("get versioning of {bucket}")).await?;
        Ok(xml_values(&body, "Status").into_iter().next())
    }

    async fn server_header(&self) -> Result<Option<String>> {
        let response = self
            .http
            .head(self.endpoint.clone())
            .send()
            .await
            .map_err(|e| Error::provider(format!("HEAD {}: {e}", self.endpoint)))?;
        Ok(response
            .headers()
            .get(reqwest::header::SERVER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }
}

/// Creates S3 clients; other providers have no bucket client
#[derive(Clone, Copy, Debug, Default)]
pub struct S3ClientFactory;

impl ObjectStorageFactory for S3ClientFactory {
    fn client(&self, target: &StorageTarget) -> Result<Arc<dyn ObjectStorage>> {
        match target.provider.as_str() {
            "aws" => Ok(Arc::new(S3Client::new(target)?)),
            other => Err(Error::provider(format!(
                "unable to determine bucket client for provider {other:?}"
            ))),
        }
    }
}

/// Text content of every `<tag>` element, unescaped
fn xml_values(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        match after.find(&close) {
            Some(end) => {
                out.push(xml_unescape(&after[..end]));
                rest = &after[end + close.len()..];
            }
            None => break,
        }
    }
    out
}

fn parse_tags(body: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    let mut rest = body;
    while let Some(start) = rest.find("<Tag>") {
        let after = &rest[start + 5..];
        let Some(end) = after.find("</Tag>") else { break };
        let tag = &after[..end];
        if let (Some(k), Some(v)) = (
            xml_values(tag, "Key").into_iter().next(),
            xml_values(tag, "Value").into_iter().next(),
        ) {
            tags.insert(k, v);
        }
        rest = &after[end + 6..];
    }
    tags
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_list_and_tag_responses() {
        let list = "<ListBucketResult><Contents><Key>velero/a</Key></Contents>\
                    <Contents><Key>velero/b&amp;c</Key></Contents></ListBucketResult>";
        assert_eq!(xml_values(list, "Key"), vec!["velero/a", "velero/b&c"]);

        let tags = "<Tagging><TagSet><Tag><Key>oadp.openshift.io/cloudstorage-uid</Key>\
                    <Value>abc</Value></Tag></TagSet></Tagging>";
        assert_eq!(
            parse_tags(tags).get("oadp.openshift.io/cloudstorage-uid").map(String::as_str),
            Some("abc")
        );
    }

    #[test]
    fn custom_endpoint_paths() {
        let client = S3Client::new(&StorageTarget {
            provider: "aws".into(),
            region: "minio".into(),
            endpoint: Some("http://minio.local:9000/".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(client.host(), "minio.local:9000");
        assert_eq!(client.path(Some("bkt"), Some("velero/x y")), "/bkt/velero/x%20y");
        assert_eq!(client.path(None, None), "/");
    }

    #[test]
    fn factory_rejects_non_aws() {
        let err = S3ClientFactory
            .client(&StorageTarget {
                provider: "gcp".into(),
                ..Default::default()
            })
            .err()
            .unwrap();
        assert!(err.to_string().contains("unable to determine bucket client"));
    }
}
