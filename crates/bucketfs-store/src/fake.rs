//! In-memory object store for tests.
//!
//! Behaves like the real store where it matters to bucketfs: per-name
//! monotonic generations, generation preconditions on every mutation,
//! pinned-generation reads, and lexicographic delimiter listings with
//! pagination. Integration tests across the workspace drive the filesystem
//! against this implementation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bucketfs_core::domain::{Generation, Metageneration, ObjectMetadata, ObjectName, StoreError};
use bucketfs_core::ports::object_store::{
    CreateRequest, ListRequest, Listing, ObjectStore, ReadRequest, StoreResult,
};
use chrono::Utc;

#[derive(Debug, Clone)]
struct FakeObject {
    metadata: ObjectMetadata,
    content: Vec<u8>,
}

/// In-memory, generation-correct object store.
#[derive(Debug, Default)]
pub struct FakeObjectStore {
    /// Keyed by raw object name; BTreeMap gives lexicographic listings.
    objects: Mutex<BTreeMap<String, FakeObject>>,
    next_generation: AtomicI64,
    /// Calls that reached the store, by coarse kind.
    stat_calls: AtomicUsize,
    list_calls: AtomicUsize,
    read_calls: AtomicUsize,
    write_calls: AtomicUsize,
    /// Pending injected failures, popped one per call.
    failures: Mutex<Vec<StoreError>>,
}

impl FakeObjectStore {
    pub fn new() -> Self {
        Self {
            next_generation: AtomicI64::new(1),
            ..Self::default()
        }
    }

    fn allocate_generation(&self) -> Generation {
        Generation(self.next_generation.fetch_add(1, Ordering::SeqCst))
    }

    /// Seeds an object directly, bypassing preconditions. Returns its
    /// metadata.
    pub fn put(&self, name: &str, content: &[u8]) -> ObjectMetadata {
        let name = ObjectName::new(name).expect("valid test object name");
        let generation = self.allocate_generation();
        let mut metadata = ObjectMetadata::new(name.clone(), generation, content.len() as u64);
        metadata.crc32c = Some(crc32c::crc32c(content));
        let object = FakeObject {
            metadata: metadata.clone(),
            content: content.to_vec(),
        };
        self.objects
            .lock()
            .unwrap()
            .insert(name.as_str().to_string(), object);
        metadata
    }

    /// Seeds an object with custom metadata attached.
    pub fn put_with_metadata(
        &self,
        name: &str,
        content: &[u8],
        custom: &[(&str, &str)],
    ) -> ObjectMetadata {
        let mut metadata = self.put(name, content);
        for (key, value) in custom {
            metadata
                .custom
                .insert((*key).to_string(), (*value).to_string());
        }
        self.objects
            .lock()
            .unwrap()
            .get_mut(metadata.name.as_str())
            .expect("object just inserted")
            .metadata = metadata.clone();
        metadata
    }

    /// Queues an error to be returned by the next store call.
    pub fn inject_failure(&self, error: StoreError) {
        self.failures.lock().unwrap().push(error);
    }

    fn take_failure(&self) -> Option<StoreError> {
        let mut failures = self.failures.lock().unwrap();
        if failures.is_empty() {
            None
        } else {
            Some(failures.remove(0))
        }
    }

    /// Number of stat calls that reached the store.
    pub fn stat_calls(&self) -> usize {
        self.stat_calls.load(Ordering::SeqCst)
    }

    /// Number of list calls that reached the store.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of range reads that reached the store.
    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Number of mutations that reached the store.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Raw content of an object, for assertions.
    pub fn content_of(&self, name: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(name)
            .map(|o| o.content.clone())
    }

    /// True if the name currently exists.
    pub fn contains(&self, name: &str) -> bool {
        self.objects.lock().unwrap().contains_key(name)
    }

    /// All object names currently present, in lexicographic order.
    pub fn object_names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    fn check_precondition(
        current: Option<&FakeObject>,
        condition: Option<Generation>,
        name: &ObjectName,
    ) -> StoreResult<()> {
        let Some(expected) = condition else {
            return Ok(());
        };
        let actual = current
            .map(|o| o.metadata.generation)
            .unwrap_or(Generation::NONE);
        if actual != expected {
            return Err(StoreError::PreconditionFailed {
                name: name.as_str().to_string(),
                expected: expected.get(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn stat_object(&self, name: &ObjectName) -> StoreResult<ObjectMetadata> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let objects = self.objects.lock().unwrap();
        objects
            .get(name.as_str())
            .map(|o| o.metadata.clone())
            .ok_or_else(|| StoreError::NotFound(name.as_str().to_string()))
    }

    async fn list_objects(&self, req: &ListRequest) -> StoreResult<Listing> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let objects = self.objects.lock().unwrap();

        let mut listing = Listing::default();
        let mut last_emitted: Option<String> = None;
        let start_after = req.continuation_token.clone().unwrap_or_default();

        for (key, object) in objects.range(req.prefix.clone()..) {
            if !key.starts_with(&req.prefix) {
                break;
            }
            if !start_after.is_empty() {
                // Skip everything already covered by the previous page. A
                // token ending in the delimiter is a reported prefix; keys
                // rolled up under it are covered too.
                let covered_by_prefix = req
                    .delimiter
                    .is_some_and(|d| start_after.ends_with(d))
                    && key.starts_with(&start_after);
                if key.as_str() <= start_after.as_str() || covered_by_prefix {
                    continue;
                }
            }
            if listing.objects.len() + listing.prefixes.len() >= req.max_results {
                listing.next_token = last_emitted;
                return Ok(listing);
            }

            let remainder = &key[req.prefix.len()..];
            match req.delimiter {
                Some(delimiter) => match remainder.find(delimiter) {
                    Some(idx) => {
                        let prefix = format!("{}{}", req.prefix, &remainder[..=idx]);
                        if listing.prefixes.last() != Some(&prefix) {
                            last_emitted = Some(prefix.clone());
                            listing.prefixes.push(prefix);
                        }
                    }
                    None => {
                        last_emitted = Some(key.clone());
                        listing.objects.push(object.metadata.clone());
                    }
                },
                None => {
                    last_emitted = Some(key.clone());
                    listing.objects.push(object.metadata.clone());
                }
            }
        }
        Ok(listing)
    }

    async fn read_object(&self, req: &ReadRequest) -> StoreResult<Vec<u8>> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(req.name.as_str())
            .ok_or_else(|| StoreError::NotFound(req.name.as_str().to_string()))?;

        // A pinned read of a replaced generation is a precondition failure.
        if req.generation.exists() && object.metadata.generation != req.generation {
            return Err(StoreError::PreconditionFailed {
                name: req.name.as_str().to_string(),
                expected: req.generation.get(),
            });
        }

        let len = object.content.len() as u64;
        let start = req.range.start.min(len) as usize;
        let end = req.range.end.min(len) as usize;
        Ok(object.content[start..end.max(start)].to_vec())
    }

    async fn create_object(&self, req: CreateRequest) -> StoreResult<ObjectMetadata> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let mut objects = self.objects.lock().unwrap();
        Self::check_precondition(
            objects.get(req.name.as_str()),
            req.if_generation_match,
            &req.name,
        )?;

        let generation = self.allocate_generation();
        let mut metadata = ObjectMetadata::new(req.name.clone(), generation, req.contents.len() as u64);
        metadata.content_type = req.content_type;
        metadata.custom = req.metadata;
        metadata.crc32c = Some(crc32c::crc32c(&req.contents));
        metadata.updated = Utc::now();

        objects.insert(
            req.name.as_str().to_string(),
            FakeObject {
                metadata: metadata.clone(),
                content: req.contents,
            },
        );
        Ok(metadata)
    }

    async fn copy_object(
        &self,
        src: &ObjectName,
        src_generation: Generation,
        dst: &ObjectName,
        if_generation_match: Option<Generation>,
    ) -> StoreResult<ObjectMetadata> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let mut objects = self.objects.lock().unwrap();
        let source = objects
            .get(src.as_str())
            .ok_or_else(|| StoreError::NotFound(src.as_str().to_string()))?;
        if src_generation.exists() && source.metadata.generation != src_generation {
            return Err(StoreError::PreconditionFailed {
                name: src.as_str().to_string(),
                expected: src_generation.get(),
            });
        }
        Self::check_precondition(objects.get(dst.as_str()), if_generation_match, dst)?;

        let mut copied = source.clone();
        copied.metadata.name = dst.clone();
        copied.metadata.generation = self.allocate_generation();
        copied.metadata.metageneration = Metageneration(1);
        copied.metadata.updated = Utc::now();
        let metadata = copied.metadata.clone();
        objects.insert(dst.as_str().to_string(), copied);
        Ok(metadata)
    }

    async fn compose_objects(
        &self,
        dst: &ObjectName,
        sources: &[ObjectName],
        if_generation_match: Option<Generation>,
    ) -> StoreResult<ObjectMetadata> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let mut objects = self.objects.lock().unwrap();
        Self::check_precondition(objects.get(dst.as_str()), if_generation_match, dst)?;

        let mut content = Vec::new();
        for source in sources {
            let object = objects
                .get(source.as_str())
                .ok_or_else(|| StoreError::NotFound(source.as_str().to_string()))?;
            content.extend_from_slice(&object.content);
        }

        let generation = self.allocate_generation();
        let mut metadata = ObjectMetadata::new(dst.clone(), generation, content.len() as u64);
        metadata.crc32c = Some(crc32c::crc32c(&content));
        objects.insert(
            dst.as_str().to_string(),
            FakeObject {
                metadata: metadata.clone(),
                content,
            },
        );
        Ok(metadata)
    }

    async fn delete_object(
        &self,
        name: &ObjectName,
        if_generation_match: Option<Generation>,
    ) -> StoreResult<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let mut objects = self.objects.lock().unwrap();
        if !objects.contains_key(name.as_str()) {
            return Err(StoreError::NotFound(name.as_str().to_string()));
        }
        Self::check_precondition(objects.get(name.as_str()), if_generation_match, name)?;
        objects.remove(name.as_str());
        Ok(())
    }
}
