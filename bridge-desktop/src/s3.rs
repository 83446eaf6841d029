//! S3 Object Store using the AWS SDK
//!
//! Implements [`ObjectStore`] for one bucket. Workbooks are uploaded with
//! their tags in the same `PutObject` request; the lifecycle "touch" is a
//! copy-in-place with `MetadataDirective=REPLACE`, which rewrites
//! `Last-Modified` without transferring content. The object's content headers
//! and user metadata are read first and written back with the copy.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::head_object::HeadObjectOutput;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{MetadataDirective, Tag, Tagging, TaggingDirective};
use aws_sdk_s3::Client;
use bridge_traits::{
    error::{BridgeError, Result},
    object_store::{ObjectBody, ObjectStore, TagSet},
};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::debug;

/// Connection settings for [`S3ObjectStore::connect`].
///
/// Unset fields fall back to the AWS default provider chain (environment,
/// profile, instance metadata).
#[derive(Clone, Default)]
pub struct S3Settings {
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services; enables path-style access
    pub endpoint_url: Option<String>,
    pub key_id: Option<String>,
    pub access_key: Option<String>,
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("key_id", &self.key_id.as_ref().map(|_| "<redacted>"))
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from `settings` and bind it to `bucket`.
    pub async fn connect(settings: &S3Settings, bucket: impl Into<String>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let (Some(key_id), Some(access_key)) = (&settings.key_id, &settings.access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key_id.clone(),
                access_key.clone(),
                None,
                None,
                "tableau-backup-config",
            ));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &settings.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self::new(Client::from_conf(builder.build()), bucket)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn copy_source(&self, key: &str) -> String {
        format!("{}/{}", self.bucket, urlencoding::encode(key))
    }
}

/// `PutObject` `x-amz-tagging` header value: URL-encoded query string.
pub fn encode_tagging(tags: &TagSet) -> String {
    tags.iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn to_tagging(tags: &TagSet) -> Result<Tagging> {
    let tag_set = tags
        .iter()
        .map(|(k, v)| {
            Tag::builder()
                .key(k)
                .value(v)
                .build()
                .map_err(|e| BridgeError::InvalidData(e.to_string()))
        })
        .collect::<Result<Vec<_>>>()?;

    Tagging::builder()
        .set_tag_set(Some(tag_set))
        .build()
        .map_err(|e| BridgeError::InvalidData(e.to_string()))
}

/// Map an S3 error code to the bridge taxonomy.
pub fn classify_code(code: &str, message: String) -> Option<BridgeError> {
    let error = match code {
        "NoSuchKey" | "NotFound" | "NoSuchTagSet" => BridgeError::NotFound(message),
        "SlowDown" | "Throttling" | "ThrottlingException" | "RequestLimitExceeded"
        | "TooManyRequests" => BridgeError::Throttled(message),
        "AccessDenied" | "AllAccessDisabled" | "AccountProblem" => BridgeError::AccessDenied(message),
        "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken" | "InvalidToken" => {
            BridgeError::AuthError(message)
        }
        "InternalError" | "ServiceUnavailable" | "RequestTimeout" | "RequestTimeTooSkewed" => {
            BridgeError::Transient(message)
        }
        "InvalidTag" | "InvalidArgument" | "MalformedXML" | "EntityTooLarge" => {
            BridgeError::InvalidData(message)
        }
        _ => return None,
    };
    Some(error)
}

/// Headers a `REPLACE` copy drops unless they are sent again.
#[derive(Debug, Default, PartialEq)]
struct PreservedHeaders {
    content_type: Option<String>,
    content_encoding: Option<String>,
    content_disposition: Option<String>,
    cache_control: Option<String>,
    metadata: Option<HashMap<String, String>>,
}

impl PreservedHeaders {
    fn from_head(head: &HeadObjectOutput) -> Self {
        Self {
            content_type: head.content_type().map(str::to_string),
            content_encoding: head.content_encoding().map(str::to_string),
            content_disposition: head.content_disposition().map(str::to_string),
            cache_control: head.cache_control().map(str::to_string),
            metadata: head.metadata().cloned(),
        }
    }
}

fn classify<E>(op: &str, key: &str, err: SdkError<E, HttpResponse>) -> BridgeError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{} {}: {}", op, key, DisplayErrorContext(&err));

    if matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
    ) {
        return BridgeError::Transient(message);
    }

    if let Some(code) = err.as_service_error().and_then(|e| e.code()) {
        if let Some(classified) = classify_code(code, message.clone()) {
            return classified;
        }
    }

    match err.raw_response().map(|r| r.status().as_u16()) {
        Some(status) => BridgeError::from_status(status, message),
        None => BridgeError::OperationFailed(message),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, body: ObjectBody, tags: &TagSet) -> Result<()> {
        let stream = match body {
            ObjectBody::Bytes(bytes) => ByteStream::from(bytes),
            ObjectBody::File(path) => ByteStream::from_path(&path)
                .await
                .map_err(|e| BridgeError::Io(std::io::Error::other(e)))?,
        };

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(stream);
        if !tags.is_empty() {
            request = request.tagging(encode_tagging(tags));
        }

        request
            .send()
            .await
            .map_err(|e| classify("PutObject", key, e))?;
        debug!(bucket = %self.bucket, key, "PutObject done");
        Ok(())
    }

    async fn get_tags(&self, key: &str) -> Result<TagSet> {
        let response = self
            .client
            .get_object_tagging()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("GetObjectTagging", key, e))?;

        Ok(response
            .tag_set()
            .iter()
            .map(|t| (t.key().to_string(), t.value().to_string()))
            .collect())
    }

    async fn update_tags(&self, key: &str, tags: &TagSet) -> Result<()> {
        self.client
            .put_object_tagging()
            .bucket(&self.bucket)
            .key(key)
            .tagging(to_tagging(tags)?)
            .send()
            .await
            .map_err(|e| classify("PutObjectTagging", key, e))?;
        Ok(())
    }

    async fn touch_last_modified(&self, key: &str) -> Result<()> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("HeadObject", key, e))?;
        let preserved = PreservedHeaders::from_head(&head);

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(key)
            .copy_source(self.copy_source(key))
            .metadata_directive(MetadataDirective::Replace)
            .tagging_directive(TaggingDirective::Copy)
            .set_content_type(preserved.content_type)
            .set_content_encoding(preserved.content_encoding)
            .set_content_disposition(preserved.content_disposition)
            .set_cache_control(preserved.cache_control)
            .set_metadata(preserved.metadata)
            .send()
            .await
            .map_err(|e| classify("CopyObject", key, e))?;
        debug!(bucket = %self.bucket, key, "Object touched");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("DeleteObject", key, e))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Bytes>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return match classify("GetObject", key, e) {
                    BridgeError::NotFound(_) => Ok(None),
                    other => Err(other),
                }
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| BridgeError::Transient(format!("GetObject {}: {}", key, e)))?;
        Ok(Some(data.into_bytes()))
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify("PutObject", key, e))?;
        Ok(())
    }
}
