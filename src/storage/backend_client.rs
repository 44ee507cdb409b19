//! The S3-compatible object-store protocol abstraction.
//!
//! `BackendClient` is the seam between the coordinator and a concrete
//! storage node. `S3BackendClient` talks to any bucket speaking the S3 API
//! (AWS or a compatible on-prem node, via `endpoint_url` override and
//! path-style addressing). `InMemoryBackendClient` is a test double used
//! throughout this crate's own test suite.

use crate::error::BackendError;
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn head_bucket(&self, bucket: &str) -> Result<bool, BackendError>;
    async fn create_bucket(&self, bucket: &str) -> Result<(), BackendError>;
    async fn delete_bucket(&self, bucket: &str) -> Result<(), BackendError>;
    async fn list_buckets(&self) -> Result<Vec<String>, BackendError>;

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), BackendError>;
    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<i64>, BackendError>;
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, BackendError>;
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), BackendError>;
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), BackendError>;
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, BackendError>;
}

/// Talks to a real S3-compatible endpoint. `endpoint_url` lets this point at
/// any compatible node, not only AWS; path-style addressing is required for
/// most self-hosted nodes that don't support virtual-hosted buckets.
pub struct S3BackendClient {
    client: aws_sdk_s3::Client,
    backend_label: String,
}

impl S3BackendClient {
    pub async fn new(endpoint_url: &str, backend_label: &str) -> Result<Self, BackendError> {
        let shared_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(endpoint_url)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            backend_label: backend_label.to_string(),
        })
    }

    fn wrap<E: std::fmt::Display>(&self, op: &'static str, err: E) -> BackendError {
        let message = err.to_string();
        tracing::warn!(backend = %self.backend_label, op, %message, "backend call failed");
        if BackendError::is_connectivity_class(&message) {
            BackendError::Transient {
                backend: self.backend_label.clone(),
                op,
                source: anyhow::anyhow!(message),
            }
        } else {
            BackendError::Transient {
                backend: self.backend_label.clone(),
                op,
                source: anyhow::anyhow!(message),
            }
        }
    }
}

#[async_trait]
impl BackendClient for S3BackendClient {
    async fn head_bucket(&self, bucket: &str) -> Result<bool, BackendError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().map_or(false, |e| e.is_not_found()) => Ok(false),
            Err(err) => Err(self.wrap("head_bucket", err)),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), BackendError> {
        self.client
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
            .map(|_| ())
            .or_else(|err| {
                if err
                    .as_service_error()
                    .map_or(false, |e| e.is_bucket_already_owned_by_you())
                {
                    Ok(())
                } else {
                    Err(self.wrap("create_bucket", err))
                }
            })
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), BackendError> {
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| self.wrap("delete_bucket", err))
    }

    async fn list_buckets(&self) -> Result<Vec<String>, BackendError> {
        let output = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|err| self.wrap("list_buckets", err))?;

        Ok(output
            .buckets
            .unwrap_or_default()
            .into_iter()
            .filter_map(|b| b.name)
            .collect())
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), BackendError> {
        let len = data.len();
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(data.into())
            .send()
            .await
            .map(|_| {
                tracing::debug!(backend = %self.backend_label, bucket, key, len, "put_object");
            })
            .map_err(|err| self.wrap("put_object", err))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<i64>, BackendError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(output.content_length),
            Err(err) if err.as_service_error().map_or(false, |e| e.is_not_found()) => Ok(None),
            Err(err) => Err(self.wrap("head_object", err)),
        }
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, BackendError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().map_or(false, |e| e.is_no_such_key()) {
                    BackendError::NotFound {
                        backend: self.backend_label.clone(),
                        key: key.to_string(),
                    }
                } else {
                    self.wrap("get_object", err)
                }
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|err| self.wrap("get_object body", err))?
            .into_bytes();

        tracing::debug!(backend = %self.backend_label, bucket, key, len = bytes.len(), "get_object");
        Ok(bytes)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), BackendError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| self.wrap("delete_object", err))
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), BackendError> {
        use aws_sdk_s3::types::{Delete, ObjectIdentifier};

        let identifiers: Result<Vec<_>, _> = keys
            .iter()
            .map(|k| ObjectIdentifier::builder().key(k).build())
            .collect();
        let identifiers = identifiers.map_err(|err| self.wrap("delete_objects build", err))?;

        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .build()
            .map_err(|err| self.wrap("delete_objects build", err))?;

        self.client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| self.wrap("delete_objects", err))
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, BackendError> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .send()
            .await
            .map_err(|err| self.wrap("list_objects", err))?;

        Ok(output
            .contents
            .unwrap_or_default()
            .into_iter()
            .filter_map(|o| o.key)
            .collect())
    }
}

/// In-memory test double. Supports fault injection: `fail_ops` makes the
/// named operation error on its next call (connectivity-class message), and
/// `latency_ms` adds a synthetic delay so placement/failover tests can
/// exercise latency-based source selection deterministically.
#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryBackendClient {
        buckets: Mutex<HashMap<String, HashMap<String, Bytes>>>,
        pub latency_ms: Mutex<u64>,
        pub fail_next: Mutex<Option<String>>,
        label: String,
    }

    impl InMemoryBackendClient {
        pub fn new(label: impl Into<String>) -> Self {
            Self {
                buckets: Mutex::new(HashMap::new()),
                latency_ms: Mutex::new(0),
                fail_next: Mutex::new(None),
                label: label.into(),
            }
        }

        pub fn queue_failure(&self, message: impl Into<String>) {
            *self.fail_next.lock().unwrap() = Some(message.into());
        }

        fn maybe_fail(&self, op: &'static str) -> Result<(), BackendError> {
            if let Some(message) = self.fail_next.lock().unwrap().take() {
                return Err(BackendError::Transient {
                    backend: self.label.clone(),
                    op,
                    source: anyhow::anyhow!(message),
                });
            }
            Ok(())
        }

        async fn simulate_latency(&self) {
            let ms = *self.latency_ms.lock().unwrap();
            if ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            }
        }
    }

    #[async_trait]
    impl BackendClient for InMemoryBackendClient {
        async fn head_bucket(&self, bucket: &str) -> Result<bool, BackendError> {
            self.maybe_fail("head_bucket")?;
            self.simulate_latency().await;
            Ok(self.buckets.lock().unwrap().contains_key(bucket))
        }

        async fn create_bucket(&self, bucket: &str) -> Result<(), BackendError> {
            self.maybe_fail("create_bucket")?;
            self.buckets
                .lock()
                .unwrap()
                .entry(bucket.to_string())
                .or_default();
            Ok(())
        }

        async fn delete_bucket(&self, bucket: &str) -> Result<(), BackendError> {
            self.maybe_fail("delete_bucket")?;
            self.buckets.lock().unwrap().remove(bucket);
            Ok(())
        }

        async fn list_buckets(&self) -> Result<Vec<String>, BackendError> {
            self.maybe_fail("list_buckets")?;
            self.simulate_latency().await;
            Ok(self.buckets.lock().unwrap().keys().cloned().collect())
        }

        async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), BackendError> {
            self.maybe_fail("put_object")?;
            self.simulate_latency().await;
            self.buckets
                .lock()
                .unwrap()
                .entry(bucket.to_string())
                .or_default()
                .insert(key.to_string(), data);
            Ok(())
        }

        async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<i64>, BackendError> {
            self.maybe_fail("head_object")?;
            Ok(self
                .buckets
                .lock()
                .unwrap()
                .get(bucket)
                .and_then(|b| b.get(key))
                .map(|d| d.len() as i64))
        }

        async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, BackendError> {
            self.maybe_fail("get_object")?;
            self.simulate_latency().await;
            self.buckets
                .lock()
                .unwrap()
                .get(bucket)
                .and_then(|b| b.get(key))
                .cloned()
                .ok_or_else(|| BackendError::NotFound {
                    backend: self.label.clone(),
                    key: key.to_string(),
                })
        }

        async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), BackendError> {
            self.maybe_fail("delete_object")?;
            if let Some(b) = self.buckets.lock().unwrap().get_mut(bucket) {
                b.remove(key);
            }
            Ok(())
        }

        async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<(), BackendError> {
            self.maybe_fail("delete_objects")?;
            if let Some(b) = self.buckets.lock().unwrap().get_mut(bucket) {
                for key in keys {
                    b.remove(key);
                }
            }
            Ok(())
        }

        async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, BackendError> {
            self.maybe_fail("list_objects")?;
            Ok(self
                .buckets
                .lock()
                .unwrap()
                .get(bucket)
                .map(|b| {
                    b.keys()
                        .filter(|k| k.starts_with(prefix))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }
    }
}
