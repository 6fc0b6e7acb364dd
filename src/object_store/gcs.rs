use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Client;
use ring::signature::RsaKeyPair;
use serde::Deserialize;
use std::time::Duration;

use super::{ObjectStore, ObjectStoreError, PresignedUrl, RemoteStore};

const GCS_HOST: &str = "storage.googleapis.com";
const METADATA_BASE: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default";

/// Google Cloud Storage object store backend.
pub struct GcsStore {
    bucket: String,
    client: Client,
    credentials: Credentials,
    access_token: tokio::sync::RwLock<Option<AccessToken>>,
    timeout: Duration,
}

enum Credentials {
    /// Service-account key: tokens and URL signatures are produced locally.
    ServiceAccount {
        client_email: String,
        token_uri: String,
        key_pair: RsaKeyPair,
    },
    /// Ambient credentials from the metadata server; URLs are signed via IAM.
    Metadata { client_email: String },
}

struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
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
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignBlobResponse {
    signed_blob: String,
}

impl GcsStore {
    pub async fn new(
        bucket: &str,
        credentials_file: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let client = Client::builder().timeout(timeout).build()?;

        let credentials = match credentials_file {
            Some(path) => {
                let key_json = tokio::fs::read_to_string(path).await?;
                let key: ServiceAccountKey = serde_json::from_str(&key_json)?;
                Credentials::ServiceAccount {
                    key_pair: parse_rsa_key(&key.private_key)?,
                    client_email: key.client_email,
                    token_uri: key.token_uri,
                }
            }
            None => {
                let client_email = client
                    .get(format!("{METADATA_BASE}/email"))
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;
                Credentials::Metadata {
                    client_email: client_email.trim().to_string(),
                }
            }
        };

        let store = Self {
            bucket: bucket.to_string(),
            client,
            credentials,
            access_token: tokio::sync::RwLock::new(None),
            timeout,
        };

        // Fail fast on bad credentials.
        store.token().await?;
        Ok(store)
    }

    fn client_email(&self) -> &str {
        match &self.credentials {
            Credentials::ServiceAccount { client_email, .. } => client_email,
            Credentials::Metadata { client_email } => client_email,
        }
    }

    /// Current access token, refreshed a minute before it expires.
    async fn token(&self) -> Result<String, ObjectStoreError> {
        let margin = chrono::Duration::seconds(60);
        {
            let lock = self.access_token.read().await;
            if let Some(token) = lock.as_ref() {
                if Utc::now() + margin < token.expires_at {
                    return Ok(token.value.clone());
                }
            }
        }

        let mut lock = self.access_token.write().await;
        if let Some(token) = lock.as_ref() {
            if Utc::now() + margin < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let fresh = self
            .fetch_token()
            .await
            .map_err(|e| ObjectStoreError::Backend(format!("GCS token refresh failed: {e}")))?;
        let value = fresh.value.clone();
        *lock = Some(fresh);
        tracing::debug!(bucket = %self.bucket, "Refreshed GCS access token");
        Ok(value)
    }

    async fn fetch_token(&self) -> Result<AccessToken, anyhow::Error> {
        let resp: TokenResponse = match &self.credentials {
            Credentials::ServiceAccount {
                client_email,
                token_uri,
                key_pair,
            } => {
                let now = Utc::now().timestamp();
                let claims = serde_json::json!({
                    "iss": client_email,
                    "scope": "https://www.googleapis.com/auth/devstorage.read_write",
                    "aud": token_uri,
                    "iat": now,
                    "exp": now + 3600,
                });

                // Build JWT (header.claims.signature)
                let header = base64_url_encode(&serde_json::to_vec(&serde_json::json!({
                    "alg": "RS256",
                    "typ": "JWT"
                }))?);
                let payload = base64_url_encode(&serde_json::to_vec(&claims)?);
                let unsigned = format!("{header}.{payload}");

                let signature = sign_rs256(unsigned.as_bytes(), key_pair)?;
                let jwt = format!("{unsigned}.{}", base64_url_encode(&signature));

                self.client
                    .post(token_uri)
                    .form(&[
                        ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                        ("assertion", &jwt),
                    ])
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?
            }
            Credentials::Metadata { .. } => {
                self.client
                    .get(format!("{METADATA_BASE}/token"))
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?
            }
        };

        Ok(AccessToken {
            value: resp.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(resp.expires_in),
        })
    }

    /// Sign `data` as the service account, locally or through IAM signBlob.
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ObjectStoreError> {
        match &self.credentials {
            Credentials::ServiceAccount { key_pair, .. } => sign_rs256(data, key_pair)
                .map_err(|e| ObjectStoreError::Backend(e.to_string())),
            Credentials::Metadata { client_email } => {
                use base64::Engine;
                let token = self.token().await?;
                let url = format!(
                    "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{}:signBlob",
                    urlencoding::encode(client_email)
                );
                let resp = self
                    .client
                    .post(url)
                    .bearer_auth(&token)
                    .json(&serde_json::json!({
                        "payload": base64::engine::general_purpose::STANDARD.encode(data),
                    }))
                    .send()
                    .await
                    .map_err(|e| self.transport_error(e))?;

                if !resp.status().is_success() {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(ObjectStoreError::Backend(format!(
                        "IAM signBlob failed ({status}): {body}"
                    )));
                }

                let signed: SignBlobResponse =
                    resp.json().await.map_err(|e| self.transport_error(e))?;
                base64::engine::general_purpose::STANDARD
                    .decode(signed.signed_blob)
                    .map_err(|e| ObjectStoreError::Backend(format!("bad signBlob payload: {e}")))
            }
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> ObjectStoreError {
        if e.is_timeout() {
            ObjectStoreError::Timeout(self.timeout)
        } else {
            ObjectStoreError::Backend(e.to_string())
        }
    }

    fn upload_url(&self, key: &str) -> String {
        format!(
            "https://{GCS_HOST}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.bucket,
            urlencoding::encode(key)
        )
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "https://{GCS_HOST}/storage/v1/b/{}/o/{}",
            self.bucket,
            urlencoding::encode(key)
        )
    }

    /// Build a V4 signed GET URL for `key`.
    async fn signed_url(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, ObjectStoreError> {
        let datetime = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{date}/auto/storage/goog4_request");
        let credential = format!("{}/{scope}", self.client_email());
        let path = format!("/{}/{}", self.bucket, encode_object_path(key));

        let query = format!(
            "X-Goog-Algorithm=GOOG4-RSA-SHA256\
             &X-Goog-Credential={}\
             &X-Goog-Date={datetime}\
             &X-Goog-Expires={}\
             &X-Goog-SignedHeaders=host",
            urlencoding::encode(&credential),
            ttl.as_secs()
        );
        let canonical_request =
            format!("GET\n{path}\n{query}\nhost:{GCS_HOST}\n\nhost\nUNSIGNED-PAYLOAD");
        let digest = ring::digest::digest(&ring::digest::SHA256, canonical_request.as_bytes());
        let string_to_sign = format!(
            "GOOG4-RSA-SHA256\n{datetime}\n{scope}\n{}",
            hex::encode(digest.as_ref())
        );

        let signature = self.sign(string_to_sign.as_bytes()).await?;
        Ok(format!(
            "https://{GCS_HOST}{path}?{query}&X-Goog-Signature={}",
            hex::encode(signature)
        ))
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), ObjectStoreError> {
        let token = self.token().await?;

        let resp = self
            .client
            .post(self.upload_url(key))
            .bearer_auth(&token)
            .header("Content-Type", content_type)
            .body(data)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ObjectStoreError::Backend(format!(
                "GCS upload failed ({status}): {body}"
            )));
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        let token = self.token().await?;

        let resp = self
            .client
            .get(format!("{}?alt=media", self.object_url(key)))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ObjectStoreError::Backend(format!(
                "GCS download failed ({status}): {body}"
            )));
        }

        resp.bytes().await.map_err(|e| self.transport_error(e))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let token = self.token().await?;

        let resp = self
            .client
            .delete(self.object_url(key))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        // 404 is fine -- object already gone
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ObjectStoreError::Backend(format!(
                "GCS delete failed ({status}): {body}"
            )));
        }

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let token = self.token().await?;

        let resp = self
            .client
            .get(self.object_url(key))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        Ok(resp.status().is_success())
    }
}

#[async_trait]
impl RemoteStore for GcsStore {
    async fn presign(&self, key: &str, ttl: Duration) -> Result<PresignedUrl, ObjectStoreError> {
        let now = Utc::now();
        let url = self.signed_url(key, ttl, now).await?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| ObjectStoreError::Backend(format!("invalid ttl: {e}")))?;
        Ok(PresignedUrl {
            url,
            expires_at: now + ttl,
        })
    }
}

/// Percent-encode each `/`-separated segment of an object name.
fn encode_object_path(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn parse_rsa_key(private_key_pem: &str) -> Result<RsaKeyPair, anyhow::Error> {
    // Strip PEM headers and decode base64
    let der_b64: String = private_key_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, der_b64.trim())?;

    RsaKeyPair::from_pkcs8(&der).map_err(|e| anyhow::anyhow!("Failed to parse RSA key: {e}"))
}

fn sign_rs256(data: &[u8], key_pair: &RsaKeyPair) -> Result<Vec<u8>, anyhow::Error> {
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
