use async_trait::async_trait;
use bytes::Bytes;
use depot_storage::error::{StorageError, StorageResult};
use depot_storage::traits::{ByteStream, StorageBackend};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory backend for failover tests.
///
/// Stores objects in a map, counts every backend call, and fails all
/// operations while the failure switch is set.
pub struct MemoryBackend {
    name: &'static str,
    objects: Mutex<HashMap<String, Bytes>>,
    fail_all: AtomicBool,
    calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            objects: Mutex::new(HashMap::new()),
            fail_all: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Total backend calls observed, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    fn check(&self) -> StorageResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other(format!(
                "{} backend failing",
                self.name
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn upload(&self, key: &str, local_path: &Path) -> StorageResult<u64> {
        self.check()?;
        let data = tokio::fs::read(local_path).await.map_err(StorageError::Io)?;
        let len = data.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::from(data));
        Ok(len)
    }

    async fn upload_bytes(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.check()?;
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn upload_dir(&self, prefix: &str, local_dir: &Path) -> StorageResult<u64> {
        self.check()?;
        let mut uploaded = 0u64;
        let mut objects = self.objects.lock().unwrap();
        for entry in walkdir::WalkDir::new(local_dir).follow_links(false) {
            let entry = entry.map_err(|e| StorageError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(local_dir)
                .expect("walk stays under local_dir")
                .to_string_lossy()
                .replace('\\', "/");
            let data = std::fs::read(entry.path()).map_err(StorageError::Io)?;
            objects.insert(format!("{prefix}/{rel}"), Bytes::from(data));
            uploaded += 1;
        }
        Ok(uploaded)
    }

    async fn download(&self, key: &str) -> StorageResult<ByteStream> {
        self.check()?;
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.check()?;
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.check()?;
        self.objects
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()> {
        self.check()?;
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<u64> {
        self.check()?;
        let mut objects = self.objects.lock().unwrap();
        let doomed: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let removed = doomed.len() as u64;
        for key in doomed {
            objects.remove(&key);
        }
        Ok(removed)
    }

    fn url(&self, key: &str) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        format!("memory://{}/{}", self.name, key)
    }

    fn backend_name(&self) -> &'static str {
        self.name
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.check()
    }
}
