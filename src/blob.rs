//! Blob storage for raw document bytes.
//!
//! The pipeline only needs `put`/`get`/`stat` plus bucket bootstrap; the
//! request layer's presigned-upload issuance lives outside this crate.
//!
//! Backends:
//! - **`fs`** — directory-backed store; object keys become paths, the
//!   content type rides in a sidecar file.
//! - **`s3`** — S3-compatible REST API (AWS, MinIO, LocalStack) with
//!   AWS Signature V4 signing in pure Rust (`hmac` + `sha2`), so no C
//!   library dependencies constrain the build environment.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::BlobConfig;
use crate::error::PipelineError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct BlobStat {
    pub size: u64,
    pub content_type: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn ensure_bucket(&self) -> Result<(), PipelineError>;
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str)
        -> Result<(), PipelineError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, PipelineError>;
    async fn stat(&self, key: &str) -> Result<BlobStat, PipelineError>;
}

/// Build the configured backend.
pub fn build_blob_store(config: &BlobConfig) -> Result<Arc<dyn BlobStore>, PipelineError> {
    match config.backend.as_str() {
        "fs" => Ok(Arc::new(FsBlobStore::new(
            config.root.clone(),
            config.bucket.clone(),
        ))),
        "s3" => Ok(Arc::new(S3BlobStore::new(config)?)),
        other => Err(PipelineError::Blob(format!(
            "unknown blob backend: {}",
            other
        ))),
    }
}

// ============ Filesystem backend ============

pub struct FsBlobStore {
    root: PathBuf,
    bucket: String,
}

impl FsBlobStore {
    pub fn new(root: PathBuf, bucket: String) -> Self {
        Self { root, bucket }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, PipelineError> {
        // Keys are generated internally, but refuse traversal anyway.
        if key.split('/').any(|part| part == "..") {
            return Err(PipelineError::Blob(format!("invalid object key: {}", key)));
        }
        Ok(self.root.join(&self.bucket).join(key))
    }

    fn sidecar_path(path: &PathBuf) -> PathBuf {
        let mut sidecar = path.clone().into_os_string();
        sidecar.push(".content-type");
        PathBuf::from(sidecar)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn ensure_bucket(&self) -> Result<(), PipelineError> {
        tokio::fs::create_dir_all(self.root.join(&self.bucket))
            .await
            .map_err(|e| PipelineError::Blob(e.to_string()))
    }

    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), PipelineError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::Blob(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| PipelineError::Blob(e.to_string()))?;
        tokio::fs::write(Self::sidecar_path(&path), content_type)
            .await
            .map_err(|e| PipelineError::Blob(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, PipelineError> {
        let path = self.object_path(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::Blob(format!("get {}: {}", key, e)))
    }

    async fn stat(&self, key: &str) -> Result<BlobStat, PipelineError> {
        let path = self.object_path(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| PipelineError::Blob(format!("stat {}: {}", key, e)))?;
        let content_type = tokio::fs::read_to_string(Self::sidecar_path(&path))
            .await
            .unwrap_or_else(|_| "application/octet-stream".to_string());
        Ok(BlobStat {
            size: meta.len(),
            content_type,
        })
    }
}

// ============ S3 backend ============

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self, PipelineError> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| PipelineError::Blob("AWS_ACCESS_KEY_ID not set".to_string()))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| PipelineError::Blob("AWS_SECRET_ACCESS_KEY not set".to_string()))?;
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

pub struct S3BlobStore {
    bucket: String,
    region: String,
    /// `scheme://host` to address the bucket, plus the path prefix that
    /// puts the bucket in the path for custom (path-style) endpoints.
    base_url: String,
    base_path: String,
    client: reqwest::Client,
}

impl S3BlobStore {
    pub fn new(config: &BlobConfig) -> Result<Self, PipelineError> {
        let (base_url, base_path) = match &config.endpoint_url {
            // Custom endpoints (MinIO, LocalStack) use path-style access.
            Some(endpoint) => (
                endpoint.trim_end_matches('/').to_string(),
                format!("/{}", config.bucket),
            ),
            None => (
                format!(
                    "https://{}.s3.{}.amazonaws.com",
                    config.bucket, config.region
                ),
                String::new(),
            ),
        };
        Ok(Self {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            base_url,
            base_path,
            client: reqwest::Client::new(),
        })
    }

    fn host(&self) -> String {
        self.base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string()
    }

    fn canonical_uri(&self, key: &str) -> String {
        let encoded_key = key
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");
        if encoded_key.is_empty() {
            format!("{}/", self.base_path)
        } else {
            format!("{}/{}", self.base_path, encoded_key)
        }
    }

    /// Issue one signed request against the bucket. `key` of `""`
    /// addresses the bucket itself (used by `ensure_bucket`).
    async fn signed_request(
        &self,
        method: reqwest::Method,
        key: &str,
        body: Option<(Vec<u8>, String)>,
    ) -> Result<reqwest::Response, PipelineError> {
        let creds = AwsCredentials::from_env()?;
        let canonical_uri = self.canonical_uri(key);
        let url = format!("{}{}", self.base_url, canonical_uri);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let payload_hash = match &body {
            Some((bytes, _)) => hex_sha256(bytes),
            None => hex_sha256(b""),
        };

        let mut headers = vec![
            ("host".to_string(), self.host()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut builder = self
            .client
            .request(method, &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);

        if let Some(ref token) = creds.session_token {
            builder = builder.header("x-amz-security-token", token);
        }
        if let Some((bytes, content_type)) = body {
            builder = builder.header("Content-Type", content_type).body(bytes);
        }

        builder.send().await.map_err(|e| {
            PipelineError::Blob(format!("s3://{} request failed: {}", self.bucket, e))
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn ensure_bucket(&self) -> Result<(), PipelineError> {
        let resp = self
            .signed_request(reqwest::Method::HEAD, "", None)
            .await?;
        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status().as_u16() != 404 {
            return Err(PipelineError::Blob(format!(
                "bucket check failed (HTTP {})",
                resp.status()
            )));
        }

        let resp = self
            .signed_request(reqwest::Method::PUT, "", None)
            .await?;
        if !resp.status().is_success() {
            return Err(PipelineError::Blob(format!(
                "bucket create failed (HTTP {})",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), PipelineError> {
        let resp = self
            .signed_request(
                reqwest::Method::PUT,
                key,
                Some((bytes.to_vec(), content_type.to_string())),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(PipelineError::Blob(format!(
                "PutObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            )));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, PipelineError> {
        let resp = self.signed_request(reqwest::Method::GET, key, None).await?;
        if !resp.status().is_success() {
            return Err(PipelineError::Blob(format!(
                "GetObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| PipelineError::Blob(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn stat(&self, key: &str) -> Result<BlobStat, PipelineError> {
        let resp = self
            .signed_request(reqwest::Method::HEAD, key, None)
            .await?;
        if !resp.status().is_success() {
            return Err(PipelineError::Blob(format!(
                "HeadObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            )));
        }
        let size = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok(BlobStat { size, content_type })
    }
}

// ============ SigV4 helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the SigV4 signing key for a date, region, and service.
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986, leaving only unreserved characters.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_round_trips_bytes_and_content_type() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path().to_path_buf(), "test-bucket".into());
        store.ensure_bucket().await.unwrap();

        store
            .put("crawl/ns/doc/index.html", b"<html></html>", "text/html")
            .await
            .unwrap();

        let bytes = store.get("crawl/ns/doc/index.html").await.unwrap();
        assert_eq!(bytes, b"<html></html>");

        let stat = store.stat("crawl/ns/doc/index.html").await.unwrap();
        assert_eq!(stat.size, 13);
        assert_eq!(stat.content_type, "text/html");
    }

    #[tokio::test]
    async fn fs_store_missing_key_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path().to_path_buf(), "b".into());
        assert!(store.get("nope").await.is_err());
        assert!(store.stat("nope").await.is_err());
    }

    #[tokio::test]
    async fn fs_store_rejects_traversal_keys() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path().to_path_buf(), "b".into());
        assert!(store.put("../escape", b"x", "text/plain").await.is_err());
    }

    #[test]
    fn canonical_uri_is_path_style_for_custom_endpoints() {
        let cfg = BlobConfig {
            backend: "s3".into(),
            bucket: "docs".into(),
            endpoint_url: Some("http://localhost:9000".into()),
            ..BlobConfig::default()
        };
        let store = S3BlobStore::new(&cfg).unwrap();
        assert_eq!(store.canonical_uri("a/b c.pdf"), "/docs/a/b%20c.pdf");
        assert_eq!(store.canonical_uri(""), "/docs/");
    }

    #[test]
    fn canonical_uri_is_virtual_hosted_for_aws() {
        let cfg = BlobConfig {
            backend: "s3".into(),
            bucket: "docs".into(),
            endpoint_url: None,
            ..BlobConfig::default()
        };
        let store = S3BlobStore::new(&cfg).unwrap();
        assert_eq!(store.canonical_uri("key.pdf"), "/key.pdf");
        assert!(store.host().contains("docs.s3."));
    }

    #[test]
    fn uri_encode_preserves_unreserved() {
        assert_eq!(uri_encode("abc-_.~XYZ09"), "abc-_.~XYZ09");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn signing_key_derivation_matches_reference_vector() {
        // Known vector from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20150830",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }
}
