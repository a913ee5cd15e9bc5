use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use log::debug;

pub const DEFAULT_BUCKET_SIZE: usize = 64;

/// In-memory hash table using extendible hashing. The buffer pool keeps one
/// as its page-lookup directory, mapping a page id to the frame that caches
/// it, so the table has to stay usable while it grows.
///
/// A single directory latch protects the slot vector, the global depth and
/// the bucket count; each bucket carries its own latch. A reader snapshots
/// its slot under the directory latch and then works only on the bucket.
pub struct ExtendibleHashTable<K, V> {
    bucket_size: usize,
    directory: Mutex<Directory<K, V>>,
}

struct Directory<K, V> {
    // The slot vector holds 2^global_depth references; a bucket with local
    // depth d is referenced from exactly 2^(global_depth - d) slots.
    buckets: Vec<Arc<Bucket<K, V>>>,
    global_depth: u32,
    bucket_num: usize,
}

struct Bucket<K, V> {
    entries: Mutex<BucketEntries<K, V>>,
}

struct BucketEntries<K, V> {
    local_depth: u32,
    kv: HashMap<K, V>,
}

impl<K, V> Bucket<K, V> {
    fn new(local_depth: u32, kv: HashMap<K, V>) -> Bucket<K, V> {
        Bucket {
            entries: Mutex::new(BucketEntries { local_depth, kv }),
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> ExtendibleHashTable<K, V> {
    pub fn new(bucket_size: usize) -> ExtendibleHashTable<K, V> {
        ExtendibleHashTable {
            bucket_size,
            directory: Mutex::new(Directory {
                buckets: vec![Arc::new(Bucket::new(0, HashMap::new()))],
                global_depth: 0,
                bucket_num: 1,
            }),
        }
    }

    fn hash_key(key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Snapshots the bucket currently responsible for `key`.
    fn bucket_of(&self, key: &K) -> Arc<Bucket<K, V>> {
        let directory = self.directory.lock().expect("directory latch poisoned");
        let index = (Self::hash_key(key) & ((1u64 << directory.global_depth) - 1)) as usize;
        directory.buckets[index].clone()
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let bucket = self.bucket_of(key);
        let entries = bucket.entries.lock().expect("bucket latch poisoned");
        entries.kv.get(key).cloned()
    }

    /// Removes the entry for `key` and reports whether it was present. The
    /// directory never shrinks.
    pub fn remove(&self, key: &K) -> bool {
        let bucket = self.bucket_of(key);
        let mut entries = bucket.entries.lock().expect("bucket latch poisoned");
        entries.kv.remove(key).is_some()
    }

    /// Inserts or overwrites the entry for `key`. A full bucket is split,
    /// doubling the directory when its local depth would exceed the global
    /// depth, and the insert is retried against the re-resolved slot.
    pub fn insert(&self, key: K, value: V) {
        loop {
            let bucket = self.bucket_of(&key);
            {
                let mut entries = bucket.entries.lock().expect("bucket latch poisoned");
                if entries.kv.contains_key(&key) || entries.kv.len() < self.bucket_size {
                    entries.kv.insert(key, value);
                    return;
                }
            }
            // Overflow. The bucket latch is released before the directory
            // latch is taken; the outer loop re-resolves the slot afterwards.
            self.split_bucket(&bucket);
        }
    }

    fn split_bucket(&self, bucket: &Arc<Bucket<K, V>>) {
        let mut directory = self.directory.lock().expect("directory latch poisoned");
        let mut entries = bucket.entries.lock().expect("bucket latch poisoned");
        if entries.kv.len() < self.bucket_size {
            // Another thread split this bucket between our two lock scopes.
            return;
        }

        let mask = 1u64 << entries.local_depth;
        entries.local_depth += 1;
        if entries.local_depth > directory.global_depth {
            // Double the directory: appending a copy of every slot keeps each
            // existing bucket reachable from both halves.
            let old_slots = directory.buckets.len();
            for i in 0..old_slots {
                let slot = directory.buckets[i].clone();
                directory.buckets.push(slot);
            }
            directory.global_depth += 1;
            debug!(
                "doubled hash directory to global depth {}",
                directory.global_depth
            );
        }
        directory.bucket_num += 1;

        // Entries whose hash has the mask bit set move to the new sibling.
        let mut moved = HashMap::new();
        let mut kept = HashMap::new();
        for (key, value) in entries.kv.drain() {
            if Self::hash_key(&key) & mask != 0 {
                moved.insert(key, value);
            } else {
                kept.insert(key, value);
            }
        }
        entries.kv = kept;
        let sibling = Arc::new(Bucket::new(entries.local_depth, moved));

        // Retarget every slot that referenced the old bucket and whose index
        // has the mask bit set.
        for i in 0..directory.buckets.len() {
            if Arc::ptr_eq(&directory.buckets[i], bucket) && (i as u64) & mask != 0 {
                directory.buckets[i] = sibling.clone();
            }
        }
    }

    pub fn global_depth(&self) -> u32 {
        self.directory
            .lock()
            .expect("directory latch poisoned")
            .global_depth
    }

    pub fn local_depth(&self, bucket_index: usize) -> Option<u32> {
        let bucket = {
            let directory = self.directory.lock().expect("directory latch poisoned");
            directory.buckets.get(bucket_index)?.clone()
        };
        let entries = bucket.entries.lock().expect("bucket latch poisoned");
        Some(entries.local_depth)
    }

    pub fn num_buckets(&self) -> usize {
        self.directory
            .lock()
            .expect("directory latch poisoned")
            .bucket_num
    }
}

impl<K: Hash + Eq + Clone, V: Clone> Default for ExtendibleHashTable<K, V> {
    fn default() -> ExtendibleHashTable<K, V> {
        ExtendibleHashTable::new(DEFAULT_BUCKET_SIZE)
    }
}

#[cfg(test)]
mod extendible_hashing_tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn insert_then_find() {
        let table = ExtendibleHashTable::new(4);
        for i in 0..100u32 {
            table.insert(i, i + 1);
        }
        for i in 0..100u32 {
            assert_eq!(table.find(&i), Some(i + 1));
        }
        assert_eq!(table.find(&100), None);
    }

    #[test]
    fn insert_overwrites_existing_key() {
        let table = ExtendibleHashTable::new(4);
        table.insert(7u32, 1u32);
        table.insert(7u32, 2u32);
        assert_eq!(table.find(&7), Some(2));
    }

    #[test]
    fn removed_keys_are_gone() {
        let table = ExtendibleHashTable::new(4);
        for i in 0..50u32 {
            table.insert(i, i);
        }
        for i in 0..50u32 {
            assert!(table.remove(&i));
        }
        for i in 0..50u32 {
            assert!(!table.remove(&i));
            assert_eq!(table.find(&i), None);
        }
    }

    #[test]
    fn splits_grow_the_directory() {
        let table = ExtendibleHashTable::new(2);
        for i in 0..256u32 {
            table.insert(i, i);
        }
        assert!(table.global_depth() > 0);
        assert!(table.num_buckets() > 1);
        for i in 0..(1usize << table.global_depth()) {
            let local_depth = table.local_depth(i).expect("slot out of range");
            assert!(local_depth <= table.global_depth());
        }
        for i in 0..256u32 {
            assert_eq!(table.find(&i), Some(i));
        }
    }

    #[test]
    fn slot_indices_agree_with_bucket_signatures() {
        let table = ExtendibleHashTable::new(2);
        for i in 0..512u64 {
            table.insert(i, i);
        }

        let directory = table.directory.lock().unwrap();
        for (slot, bucket) in directory.buckets.iter().enumerate() {
            let entries = bucket.entries.lock().unwrap();
            let mask = (1u64 << entries.local_depth) - 1;
            let signature = slot as u64 & mask;
            // Every key in the bucket and every slot referencing it agree in
            // their low local-depth bits.
            for key in entries.kv.keys() {
                assert_eq!(
                    ExtendibleHashTable::<u64, u64>::hash_key(key) & mask,
                    signature
                );
            }
        }
    }

    #[test]
    fn concurrent_inserts_and_finds() {
        let table = Arc::new(ExtendibleHashTable::new(4));
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000u32 {
                    let key = t * 1000 + i;
                    table.insert(key, key + 1);
                    assert_eq!(table.find(&key), Some(key + 1));
                }
            }));
        }
        for handle in handles {
            handle.join().expect("insert thread panicked");
        }
        for key in 0..4000u32 {
            assert_eq!(table.find(&key), Some(key + 1));
        }
    }
}
