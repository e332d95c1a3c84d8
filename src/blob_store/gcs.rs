use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::io::StreamReader;

use super::{
    new_metadata, paginate, validate_id, BlobMetadata, BlobStore, BlobStoreError, BoxReader,
    ListOptions, ListResult, StoreOptions, StoredFile, METADATA_SUFFIX,
};

const GCS_ENDPOINT: &str = "https://storage.googleapis.com";
const METADATA_SERVER_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the reported expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Google Cloud Storage blob store backend.
///
/// Each blob is two objects in the bucket: `{id}` with the content and
/// `{id}.meta.json` with the metadata map. Content is uploaded first.
pub struct GcsStore {
    bucket: String,
    client: Client,
    endpoint: Url,
    /// `None` when talking to an emulator that takes no credentials
    auth: Option<TokenSource>,
}

struct TokenSource {
    credentials_file: Option<String>,
    cached: RwLock<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ObjectItem {
    name: String,
}

impl GcsStore {
    /// Connect to GCS proper, authenticating with a service account key file or,
    /// without one, the instance metadata server.
    pub async fn new(bucket: &str, credentials_file: Option<&str>) -> Result<Self, anyhow::Error> {
        let store = Self {
            bucket: bucket.to_string(),
            client: Client::builder().build()?,
            endpoint: Url::parse(GCS_ENDPOINT)?,
            auth: Some(TokenSource {
                credentials_file: credentials_file.map(|s| s.to_string()),
                cached: RwLock::new(None),
            }),
        };

        // Fail at startup rather than on the first upload.
        store.access_token().await?;
        Ok(store)
    }

    /// Connect to a GCS-compatible endpoint (e.g. an emulator) without credentials.
    pub fn with_endpoint(endpoint: &str, bucket: &str) -> Result<Self, anyhow::Error> {
        Ok(Self {
            bucket: bucket.to_string(),
            client: Client::builder().build()?,
            endpoint: Url::parse(endpoint)?,
            auth: None,
        })
    }

    async fn access_token(&self) -> Result<Option<String>, BlobStoreError> {
        let Some(ref source) = self.auth else {
            return Ok(None);
        };

        if let Some(ref token) = *source.cached.read().await {
            if token.expires_at > Instant::now() {
                return Ok(Some(token.value.clone()));
            }
        }

        let response = match source.credentials_file {
            Some(ref path) => self.token_from_service_account(path).await,
            None => self.token_from_metadata_server().await,
        }
        .map_err(|e| BlobStoreError::Backend(format!("GCS token refresh failed: {e}")))?;

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        let value = response.access_token;
        *source.cached.write().await = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });

        tracing::debug!(expires_in = response.expires_in, "Refreshed GCS access token");
        Ok(Some(value))
    }

    async fn token_from_service_account(&self, path: &str) -> Result<TokenResponse, anyhow::Error> {
        let key_json = tokio::fs::read_to_string(path).await?;
        let key: ServiceAccountKey = serde_json::from_str(&key_json)?;

        let now = chrono::Utc::now().timestamp();
        let claims = serde_json::json!({
            "iss": key.client_email,
            "scope": "https://www.googleapis.com/auth/devstorage.read_write",
            "aud": key.token_uri,
            "iat": now,
            "exp": now + 3600,
        });

        let header = base64_url_encode(&serde_json::to_vec(&serde_json::json!({
            "alg": "RS256",
            "typ": "JWT"
        }))?);
        let payload = base64_url_encode(&serde_json::to_vec(&claims)?);
        let unsigned = format!("{header}.{payload}");

        let signature = sign_rs256(unsigned.as_bytes(), &key.private_key)?;
        let jwt = format!("{unsigned}.{}", base64_url_encode(&signature));

        let resp = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await?
            .error_for_status()?;

        Ok(resp.json().await?)
    }

    async fn token_from_metadata_server(&self) -> Result<TokenResponse, anyhow::Error> {
        let resp = self
            .client
            .get(METADATA_SERVER_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?;

        Ok(resp.json().await?)
    }

    fn url(&self, segments: &[&str]) -> Result<Url, BlobStoreError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| BlobStoreError::Backend(format!("invalid GCS endpoint: {}", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, name: &str) -> Result<Url, BlobStoreError> {
        self.url(&["storage", "v1", "b", self.bucket.as_str(), "o", name])
    }

    fn upload_url(&self, name: &str) -> Result<Url, BlobStoreError> {
        let mut url = self.url(&["upload", "storage", "v1", "b", self.bucket.as_str(), "o"])?;
        // Generation 0 matches only a missing object, so existing blobs are never replaced.
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", name)
            .append_pair("ifGenerationMatch", "0");
        Ok(url)
    }

    fn list_url(&self, page_token: Option<&str>) -> Result<Url, BlobStoreError> {
        let mut url = self.url(&["storage", "v1", "b", self.bucket.as_str(), "o"])?;
        if let Some(token) = page_token {
            url.query_pairs_mut().append_pair("pageToken", token);
        }
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BlobStoreError> {
        let request = match self.access_token().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        request
            .send()
            .await
            .map_err(|e| BlobStoreError::Backend(e.to_string()))
    }

    async fn put_object(
        &self,
        name: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), BlobStoreError> {
        let request = self
            .client
            .post(self.upload_url(name)?)
            .header("Content-Type", content_type)
            .body(data);
        let resp = self.send(request).await?;

        if resp.status() == StatusCode::PRECONDITION_FAILED {
            return Err(BlobStoreError::AlreadyExists(name.to_string()));
        }
        if !resp.status().is_success() {
            return Err(failure("upload", resp).await);
        }
        Ok(())
    }

    /// `None` on 404.
    async fn get_object(&self, name: &str) -> Result<Option<Response>, BlobStoreError> {
        let mut url = self.object_url(name)?;
        url.query_pairs_mut().append_pair("alt", "media");
        let resp = self.send(self.client.get(url)).await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(failure("download", resp).await);
        }
        Ok(Some(resp))
    }

    /// `false` on 404.
    async fn delete_object(&self, name: &str) -> Result<bool, BlobStoreError> {
        let resp = self
            .send(self.client.delete(self.object_url(name)?))
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Err(failure("delete", resp).await);
        }
        Ok(true)
    }

    async fn object_exists(&self, name: &str) -> Result<bool, BlobStoreError> {
        let resp = self.send(self.client.get(self.object_url(name)?)).await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Err(failure("stat", resp).await);
        }
        Ok(true)
    }

    async fn read_metadata(&self, name: &str) -> Result<Option<BlobMetadata>, BlobStoreError> {
        let Some(resp) = self.get_object(name).await? else {
            return Ok(None);
        };
        let data = resp
            .bytes()
            .await
            .map_err(|e| BlobStoreError::Backend(e.to_string()))?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    async fn metadata_object_names(&self) -> Result<Vec<String>, BlobStoreError> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let resp = self
                .send(self.client.get(self.list_url(page_token.as_deref())?))
                .await?;
            if !resp.status().is_success() {
                return Err(failure("list", resp).await);
            }
            let page: ObjectList = resp
                .json()
                .await
                .map_err(|e| BlobStoreError::Backend(e.to_string()))?;

            names.extend(
                page.items
                    .into_iter()
                    .map(|item| item.name)
                    .filter(|name| name.ends_with(METADATA_SUFFIX)),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(names)
    }
}

fn metadata_name(id: &str) -> String {
    format!("{id}{METADATA_SUFFIX}")
}

async fn failure(operation: &str, resp: Response) -> BlobStoreError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    BlobStoreError::Backend(format!("GCS {operation} failed ({status}): {body}"))
}

#[async_trait]
impl BlobStore for GcsStore {
    async fn store(
        &self,
        content: Bytes,
        options: StoreOptions,
    ) -> Result<BlobMetadata, BlobStoreError> {
        let metadata = new_metadata(options, content.len() as u64)?;

        self.put_object(&metadata.id, content, &metadata.mime_type)
            .await?;

        let sidecar = Bytes::from(serde_json::to_vec(&metadata)?);
        if let Err(e) = self
            .put_object(&metadata_name(&metadata.id), sidecar, "application/json")
            .await
        {
            // Only the content uploaded above is removed; an existing metadata object stays.
            if let Err(cleanup) = self.delete_object(&metadata.id).await {
                tracing::warn!(file_id = %metadata.id, error = %cleanup, "Failed to clean up blob after metadata upload failure");
            }
            return Err(e);
        }

        tracing::debug!(file_id = %metadata.id, size = metadata.size, "Stored blob in GCS");
        Ok(metadata)
    }

    async fn get(&self, id: &str) -> Result<Option<StoredFile>, BlobStoreError> {
        validate_id(id)?;
        let Some(metadata) = self.read_metadata(&metadata_name(id)).await? else {
            return Ok(None);
        };
        let Some(resp) = self.get_object(id).await? else {
            return Ok(None);
        };
        let content = resp
            .bytes()
            .await
            .map_err(|e| BlobStoreError::Backend(e.to_string()))?;

        Ok(Some(StoredFile { metadata, content }))
    }

    async fn get_stream(&self, id: &str) -> Result<Option<BoxReader>, BlobStoreError> {
        validate_id(id)?;
        let Some(resp) = self.get_object(id).await? else {
            return Ok(None);
        };
        let stream = resp.bytes_stream().map_err(std::io::Error::other).boxed();
        Ok(Some(Box::new(StreamReader::new(stream))))
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<BlobMetadata>, BlobStoreError> {
        validate_id(id)?;
        self.read_metadata(&metadata_name(id)).await
    }

    async fn exists(&self, id: &str) -> Result<bool, BlobStoreError> {
        validate_id(id)?;
        self.object_exists(&metadata_name(id)).await
    }

    async fn delete(&self, id: &str) -> Result<bool, BlobStoreError> {
        validate_id(id)?;
        let had_metadata = self.delete_object(&metadata_name(id)).await?;
        let had_content = self.delete_object(id).await?;

        if had_metadata || had_content {
            tracing::debug!(file_id = %id, "Deleted blob from GCS");
        }
        Ok(had_metadata || had_content)
    }

    async fn list(&self, options: ListOptions) -> Result<ListResult, BlobStoreError> {
        let names = self.metadata_object_names().await?;
        let fetched = futures::future::try_join_all(
            names.iter().map(|name| self.read_metadata(name)),
        )
        .await?;
        let files: Vec<BlobMetadata> = fetched.into_iter().flatten().collect();
        Ok(paginate(files, &options))
    }

    async fn count(&self) -> Result<u64, BlobStoreError> {
        Ok(self.metadata_object_names().await?.len() as u64)
    }
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn sign_rs256(data: &[u8], private_key_pem: &str) -> Result<Vec<u8>, anyhow::Error> {
    use base64::Engine;

    // PEM body to DER
    let der_b64: String = private_key_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = base64::engine::general_purpose::STANDARD.decode(der_b64.trim())?;

    let key_pair = ring::signature::RsaKeyPair::from_pkcs8(&der)
        .map_err(|e| anyhow::anyhow!("Failed to parse RSA key: {e}"))?;

    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &ring::signature::RSA_PKCS1_SHA256,
            &ring::rand::SystemRandom::new(),
            data,
            &mut signature,
        )
        .map_err(|e| anyhow::anyhow!("Failed to sign: {e}"))?;

    Ok(signature)
}
