use crate::error::MapmergeError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Seam to the wafermap datastore. No caching and no retries: a transient
/// failure propagates to the caller, which decides the isolation policy.
pub trait ContentStoreLike {
    fn get(&self, reference: &str) -> Result<Vec<u8>, MapmergeError>;
    fn put(&self, payload: &[u8]) -> Result<String, MapmergeError>;
}

/// Client for the wafermap datastore webservice (WMDS): payloads are read
/// with `GET <base><reference>` and written with a bare `PUT <base>` whose
/// response body is the newly assigned reference.
pub struct WmdsStore {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl WmdsStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        WmdsStore {
            base_url,
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl ContentStoreLike for WmdsStore {
    fn get(&self, reference: &str) -> Result<Vec<u8>, MapmergeError> {
        let url = format!("{}{}", self.base_url, reference);
        debug!(%url, "fetching wafermap from the datastore");
        let response = self.client.get(&url).send()?;
        let status = response.status().as_u16();
        if status >= 300 {
            return Err(MapmergeError::ReferenceNotFound(reference.to_string()));
        }
        Ok(response.bytes()?.to_vec())
    }

    fn put(&self, payload: &[u8]) -> Result<String, MapmergeError> {
        debug!(bytes = payload.len(), url = %self.base_url, "uploading wafermap to the datastore");
        let response = self
            .client
            .put(&self.base_url)
            .header("Content-Type", "application/octet-stream")
            .body(payload.to_vec())
            .send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        if status >= 300 {
            return Err(MapmergeError::UploadFailed { status, body });
        }
        Ok(body.trim().to_string())
    }
}

/// In-memory datastore double. Hands out sequential references on put and
/// counts the puts, so tests can assert upload idempotence.
pub struct MockStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
    fail_puts: bool,
}

impl MockStore {
    pub fn new() -> Self {
        MockStore {
            objects: Mutex::new(HashMap::new()),
            puts: AtomicUsize::new(0),
            fail_puts: false,
        }
    }

    /// A store that rejects every upload with a 503.
    pub fn rejecting_uploads() -> Self {
        MockStore {
            fail_puts: true,
            ..MockStore::new()
        }
    }

    pub fn insert(&self, reference: &str, payload: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(reference.to_string(), payload.to_vec());
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl Default for MockStore {
    fn default() -> Self {
        MockStore::new()
    }
}

impl ContentStoreLike for MockStore {
    fn get(&self, reference: &str) -> Result<Vec<u8>, MapmergeError> {
        self.objects
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| MapmergeError::ReferenceNotFound(reference.to_string()))
    }

    fn put(&self, payload: &[u8]) -> Result<String, MapmergeError> {
        if self.fail_puts {
            return Err(MapmergeError::UploadFailed {
                status: 503,
                body: "store unavailable".to_string(),
            });
        }
        let n = self.puts.fetch_add(1, Ordering::SeqCst);
        let reference = format!("ref-{:06}", n);
        self.insert(&reference, payload);
        Ok(reference)
    }
}
