//! In-memory store for generated PNGs
//!
//! Images are keyed by a fresh UUID v4 and served back through
//! `/images/{id}.png`. Total stored bytes are capped; inserting past
//! the cap evicts the least-recently-stored images first.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use uuid::Uuid;

/// One stored image and its metadata.
#[derive(Debug)]
pub struct StoredImage {
    /// UUID v4 string identifying the image
    pub id: String,
    /// Encoded PNG bytes
    pub png: Vec<u8>,
    /// Pixel width
    pub width: u32,
    /// Pixel height
    pub height: u32,
    /// When the image was stored
    pub inserted_at: Instant,
}

struct ImageStoreInner {
    images: HashMap<String, Arc<StoredImage>>,
    /// Insertion order, oldest first; drives eviction.
    order: VecDeque<String>,
    total_bytes: usize,
}

/// Byte-capped in-memory image store.
pub struct ImageStore {
    inner: Mutex<ImageStoreInner>,
    max_bytes: usize,
}

impl ImageStore {
    /// Creates a store holding at most `max_bytes` of PNG data.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(ImageStoreInner {
                images: HashMap::new(),
                order: VecDeque::new(),
                total_bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Stores a PNG under a fresh UUID and returns the record.
    ///
    /// Oldest images are evicted until the new total fits the cap; the
    /// image being inserted is never evicted, even if it alone exceeds
    /// the cap.
    pub fn insert(&self, png: Vec<u8>, width: u32, height: u32) -> Arc<StoredImage> {
        let image = Arc::new(StoredImage {
            id: Uuid::new_v4().to_string(),
            png,
            width,
            height,
            inserted_at: Instant::now(),
        });

        let mut inner = self.inner.lock().expect("image store poisoned");
        inner.total_bytes += image.png.len();
        inner.order.push_back(image.id.clone());
        inner.images.insert(image.id.clone(), Arc::clone(&image));

        while inner.total_bytes > self.max_bytes && inner.order.len() > 1 {
            if let Some(oldest) = inner.order.pop_front() {
                if let Some(evicted) = inner.images.remove(&oldest) {
                    inner.total_bytes -= evicted.png.len();
                    tracing::debug!(image = %oldest, "evicted image over byte cap");
                }
            }
        }

        image
    }

    /// Looks up an image by id.
    pub fn get(&self, id: &str) -> Option<Arc<StoredImage>> {
        self.inner
            .lock()
            .expect("image store poisoned")
            .images
            .get(id)
            .cloned()
    }

    /// Number of stored images.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("image store poisoned").images.len()
    }

    /// True when no images are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total PNG bytes currently held.
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().expect("image store poisoned").total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get_round_trip() {
        let store = ImageStore::new(1024 * 1024);
        let image = store.insert(vec![1, 2, 3, 4], 2, 2);

        assert!(Uuid::parse_str(&image.id).is_ok(), "id is a UUID");
        let fetched = store.get(&image.id).unwrap();
        assert_eq!(fetched.png, vec![1, 2, 3, 4]);
        assert_eq!(fetched.width, 2);
        assert_eq!(store.total_bytes(), 4);
    }

    #[test]
    fn test_get_unknown_id_is_none() {
        let store = ImageStore::new(1024);
        assert!(store.get("not-a-real-id").is_none());
    }

    #[test]
    fn test_eviction_drops_least_recently_stored() {
        let store = ImageStore::new(10);
        let first = store.insert(vec![0u8; 4], 1, 1);
        let second = store.insert(vec![0u8; 4], 1, 1);
        // 4 + 4 + 4 > 10: first goes.
        let third = store.insert(vec![0u8; 4], 1, 1);

        assert!(store.get(&first.id).is_none());
        assert!(store.get(&second.id).is_some());
        assert!(store.get(&third.id).is_some());
        assert_eq!(store.total_bytes(), 8);
    }

    #[test]
    fn test_oversize_image_survives_alone() {
        let store = ImageStore::new(10);
        let small = store.insert(vec![0u8; 4], 1, 1);
        let huge = store.insert(vec![0u8; 100], 10, 10);

        assert!(store.get(&small.id).is_none());
        assert!(store.get(&huge.id).is_some(), "newest is never evicted");
        assert_eq!(store.len(), 1);
    }
}
