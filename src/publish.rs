//! Resource publishing: the process-wide table of transient image locators
//!
//! Processed images are stored in a [`ResourceTable`] and handed out as
//! `blob://<uuid>` references. Entries are reference counted. Every creation
//! or retain must be matched by exactly one release; [`PublishedHandle`] does
//! the release in its `Drop`, so holders never have to remember to.

use crate::engine::ProcessedImage;
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Scheme prefix of published references
pub const BLOB_SCHEME: &str = "blob://";

/// Locator for a published image, valid only within this process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PublishedReference(Arc<str>);

impl PublishedReference {
    fn from_id(id: Uuid) -> Self {
        Self(Arc::from(format!("{}{}", BLOB_SCHEME, id)))
    }

    /// Parse a `blob://<uuid>` locator
    #[must_use]
    pub fn parse(uri: &str) -> Option<Self> {
        let id = uri.strip_prefix(BLOB_SCHEME)?;
        Uuid::parse_str(id).ok().map(Self::from_id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn id(&self) -> Option<Uuid> {
        self.0
            .strip_prefix(BLOB_SCHEME)
            .and_then(|id| Uuid::parse_str(id).ok())
    }
}

impl std::fmt::Display for PublishedReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PublishedReference {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Bytes and metadata of a live published resource
#[derive(Debug, Clone)]
pub struct PublishedResource {
    pub data: Arc<[u8]>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub created_at: DateTime<Utc>,
}

/// Resource table statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceTableStats {
    /// Number of entries currently live
    pub live: usize,
    /// Total bytes held by live entries
    pub live_bytes: u64,
    /// Entries created since the table was built
    pub created: u64,
    /// Entries fully released since the table was built
    pub released: u64,
    /// Release calls for references that were not live (caller defects)
    pub invalid_releases: u64,
    /// Publish attempts rejected because the table was full
    pub rejected: u64,
}

struct ResourceEntry {
    resource: PublishedResource,
    refs: usize,
}

struct TableInner {
    entries: HashMap<Uuid, ResourceEntry>,
    capacity: usize,
    stats: ResourceTableStats,
}

/// Process-wide table of published resources
///
/// Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct ResourceTable {
    inner: Arc<Mutex<TableInner>>,
}

impl std::fmt::Debug for ResourceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTable")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ResourceTable {
    /// Create a table holding at most `capacity` live entries
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableInner {
                entries: HashMap::new(),
                capacity: capacity.max(1),
                stats: ResourceTableStats::default(),
            })),
        }
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish processed bytes, returning an owned handle
    ///
    /// # Errors
    /// - Empty payload
    /// - Table at capacity
    pub fn publish(&self, image: ProcessedImage) -> Result<PublishedHandle> {
        if image.data.is_empty() {
            return Err(PipelineError::publish("Refusing to publish an empty image"));
        }

        let mut inner = self.lock();
        if inner.entries.len() >= inner.capacity {
            inner.stats.rejected += 1;
            return Err(PipelineError::publish(format!(
                "Resource table exhausted ({} live entries)",
                inner.capacity
            )));
        }

        let id = Uuid::new_v4();
        let size = image.data.len() as u64;
        inner.entries.insert(
            id,
            ResourceEntry {
                resource: PublishedResource {
                    data: Arc::from(image.data),
                    mime_type: image.mime_type,
                    width: image.width,
                    height: image.height,
                    created_at: Utc::now(),
                },
                refs: 1,
            },
        );
        inner.stats.created += 1;
        inner.stats.live = inner.entries.len();
        inner.stats.live_bytes += size;
        drop(inner);

        let reference = PublishedReference::from_id(id);
        log::debug!("Published {} ({} bytes)", reference, size);
        Ok(PublishedHandle {
            table: self.clone(),
            reference,
        })
    }

    /// Take an additional owned handle on a live reference
    ///
    /// Returns `None` if the reference has already been fully released.
    #[must_use]
    pub fn retain(&self, reference: &PublishedReference) -> Option<PublishedHandle> {
        let id = reference.id()?;
        let mut inner = self.lock();
        let entry = inner.entries.get_mut(&id)?;
        entry.refs += 1;
        Some(PublishedHandle {
            table: self.clone(),
            reference: reference.clone(),
        })
    }

    /// Release one reference count of `reference`
    ///
    /// Calling this for a reference that is no longer live is a caller defect
    /// and is reported as an error, never silently ignored.
    ///
    /// # Errors
    /// - Reference is not live in this table
    pub fn release(&self, reference: &PublishedReference) -> Result<()> {
        let mut inner = self.lock();
        let remaining = reference.id().and_then(|id| {
            inner.entries.get_mut(&id).map(|entry| {
                entry.refs -= 1;
                (id, entry.refs)
            })
        });

        match remaining {
            None => {
                inner.stats.invalid_releases += 1;
                drop(inner);
                log::warn!("Release of {} which is not live (double release?)", reference);
                Err(PipelineError::publish(format!(
                    "Reference {} is not live",
                    reference
                )))
            },
            Some((id, 0)) => {
                if let Some(removed) = inner.entries.remove(&id) {
                    inner.stats.live_bytes = inner
                        .stats
                        .live_bytes
                        .saturating_sub(removed.resource.data.len() as u64);
                }
                inner.stats.released += 1;
                inner.stats.live = inner.entries.len();
                drop(inner);
                log::debug!("Released {}", reference);
                Ok(())
            },
            Some(_) => Ok(()),
        }
    }

    /// Look up the bytes behind a live `blob://` locator
    #[must_use]
    pub fn resolve(&self, uri: &str) -> Option<PublishedResource> {
        let id = PublishedReference::parse(uri)?.id()?;
        self.lock().entries.get(&id).map(|e| e.resource.clone())
    }

    /// Whether a reference is currently live
    #[must_use]
    pub fn is_live(&self, reference: &PublishedReference) -> bool {
        reference
            .id()
            .is_some_and(|id| self.lock().entries.contains_key(&id))
    }

    /// Number of holders of a live reference (0 if released)
    #[must_use]
    pub fn ref_count(&self, reference: &PublishedReference) -> usize {
        reference
            .id()
            .and_then(|id| self.lock().entries.get(&id).map(|e| e.refs))
            .unwrap_or(0)
    }

    /// Number of live entries
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn stats(&self) -> ResourceTableStats {
        self.lock().stats.clone()
    }
}

impl Default for ResourceTable {
    fn default() -> Self {
        Self::with_capacity(crate::config::PipelineConfig::default().max_published_resources)
    }
}

/// Owned handle on a published resource; dropping it releases one count
pub struct PublishedHandle {
    table: ResourceTable,
    reference: PublishedReference,
}

impl PublishedHandle {
    #[must_use]
    pub fn reference(&self) -> &PublishedReference {
        &self.reference
    }

    #[must_use]
    pub fn table(&self) -> &ResourceTable {
        &self.table
    }

    /// Bytes of the published image
    #[must_use]
    pub fn resource(&self) -> Option<PublishedResource> {
        self.table.resolve(self.reference.as_str())
    }
}

impl Clone for PublishedHandle {
    fn clone(&self) -> Self {
        match self.table.retain(&self.reference) {
            Some(handle) => handle,
            // Unreachable while `self` holds a count; keep the table consistent anyway.
            None => Self {
                table: self.table.clone(),
                reference: self.reference.clone(),
            },
        }
    }
}

impl Drop for PublishedHandle {
    fn drop(&mut self) {
        if let Err(e) = self.table.release(&self.reference) {
            log::error!("Published handle release failed: {}", e);
        }
    }
}

impl std::fmt::Debug for PublishedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublishedHandle").field(&self.reference).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_payload() -> ProcessedImage {
        ProcessedImage {
            data: vec![0x89, b'P', b'N', b'G', 1, 2, 3],
            mime_type: "image/png".to_string(),
            width: 1,
            height: 1,
        }
    }

    #[test]
    fn test_reference_serializes_as_locator() {
        let table = ResourceTable::with_capacity(1);
        let handle = table.publish(png_payload()).unwrap();
        let json = serde_json::to_string(handle.reference()).unwrap();
        assert_eq!(json, format!("\"{}\"", handle.reference()));
    }

    #[test]
    fn test_publish_and_drop_releases() {
        let table = ResourceTable::with_capacity(4);
        let handle = table.publish(png_payload()).unwrap();
        let reference = handle.reference().clone();

        assert!(reference.as_str().starts_with(BLOB_SCHEME));
        assert!(table.is_live(&reference));
        assert_eq!(table.live_count(), 1);

        let resource = table.resolve(reference.as_str()).unwrap();
        assert_eq!(resource.mime_type, "image/png");
        assert_eq!(&*resource.data, &[0x89, b'P', b'N', b'G', 1, 2, 3]);

        drop(handle);
        assert!(!table.is_live(&reference));
        assert!(table.resolve(reference.as_str()).is_none());

        let stats = table.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.live, 0);
        assert_eq!(stats.live_bytes, 0);
    }

    #[test]
    fn test_clone_shares_entry_until_last_release() {
        let table = ResourceTable::with_capacity(4);
        let first = table.publish(png_payload()).unwrap();
        let second = first.clone();
        let reference = first.reference().clone();
        assert_eq!(table.ref_count(&reference), 2);
        assert_eq!(table.live_count(), 1);

        drop(first);
        assert!(table.is_live(&reference));
        drop(second);
        assert!(!table.is_live(&reference));
        assert_eq!(table.stats().created, 1);
        assert_eq!(table.stats().released, 1);
    }

    #[test]
    fn test_double_release_is_reported() {
        let table = ResourceTable::with_capacity(4);
        let handle = table.publish(png_payload()).unwrap();
        let reference = handle.reference().clone();
        drop(handle);

        let err = table.release(&reference).unwrap_err();
        assert!(matches!(err, PipelineError::Publish(_)));
        assert_eq!(table.stats().invalid_releases, 1);
    }

    #[test]
    fn test_explicit_release_through_retained_count() {
        let table = ResourceTable::with_capacity(4);
        let handle = table.publish(png_payload()).unwrap();
        let reference = handle.reference().clone();

        // A detached holder retains and later releases explicitly
        let retained = table.retain(&reference).unwrap();
        assert_eq!(table.ref_count(&reference), 2);
        drop(retained);
        assert_eq!(table.ref_count(&reference), 1);

        drop(handle);
        assert!(table.retain(&reference).is_none());
    }

    #[test]
    fn test_capacity_exhaustion() {
        let table = ResourceTable::with_capacity(1);
        let held = table.publish(png_payload()).unwrap();
        let err = table.publish(png_payload()).unwrap_err();
        assert!(err.to_string().contains("exhausted"));
        assert_eq!(table.stats().rejected, 1);

        drop(held);
        assert!(table.publish(png_payload()).is_ok());
    }

    #[test]
    fn test_empty_payload_rejected() {
        let table = ResourceTable::with_capacity(1);
        let mut payload = png_payload();
        payload.data.clear();
        assert!(table.publish(payload).is_err());
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_reference_parsing() {
        assert!(PublishedReference::parse("blob://not-a-uuid").is_none());
        assert!(PublishedReference::parse("https://cdn.example/logo.png").is_none());

        let id = Uuid::new_v4();
        let parsed = PublishedReference::parse(&format!("blob://{}", id)).unwrap();
        assert_eq!(parsed.as_str(), format!("blob://{}", id));
    }
}
