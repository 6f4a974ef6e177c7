//! Shared word dictionary: dense, thread-safe string ⇄ id mapping.
//!
//! Every string observed on the wire is interned exactly once and referred
//! to by a `u32` id everywhere downstream (packets, report keys,
//! snapshots). Id 0 is reserved for the empty string and never stored.
//!
//! Words carry a global reference count, incremented by
//! [`Dictionary::get_or_add_ref`] for every persistent holder (a repacker
//! word-slice, transitively report ticks and snapshots) and decremented by
//! [`Dictionary::erase_word_ref`]. A word is removed — and its id recycled
//! through a free-list — only when the count reaches zero. Id reuse is
//! ABA-safe as long as consumers dereference ids through a live word-slice,
//! which is the invariant the repacker reclamation protocol maintains.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, SharedValue};
use parking_lot::{Mutex, RwLock};

use crate::bloom::bloom_hash;

// Fixed seeds: the repacker per-thread cache stores this hash with every
// entry and hands it back, so it must agree with the dictionary's shard
// selection across threads.
const WORD_HASH_SEEDS: (u64, u64, u64, u64) = (
    0x6c62_272e_07bb_0142,
    0x62b8_2175_6295_c58d,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
);

/// The fixed-seed hasher behind [`word_hash`]; the repacker cache uses the
/// same instance so its stored hashes stay valid across rehashes.
#[must_use]
pub(crate) fn word_hasher() -> ahash::RandomState {
    ahash::RandomState::with_seeds(
        WORD_HASH_SEEDS.0,
        WORD_HASH_SEEDS.1,
        WORD_HASH_SEEDS.2,
        WORD_HASH_SEEDS.3,
    )
}

/// Hashes a word for dictionary sharding and cache addressing.
#[inline]
#[must_use]
pub fn word_hash(word: &str) -> u64 {
    word_hasher().hash_one(word)
}

/// A referenced dictionary word: id plus the stable string. Handed out by
/// [`Dictionary::get_or_add_ref`]; the holder owns one global reference
/// until the reclamation protocol releases it.
#[derive(Debug)]
pub struct Word {
    pub id: u32,
    /// Hash of `text` (see [`word_hash`]); stored so cache rehashing never
    /// touches the string again.
    pub hash: u64,
    pub text: Arc<str>,
}

pub type WordRef = Arc<Word>;

/// A set of word references observed by one repacker thread during one
/// slice window. Packet batches embed the slice that was current when they
/// were built; report ticks and snapshots inherit it, keeping every
/// referenced word alive until the last holder drops.
#[derive(Debug, Default)]
pub struct WordSlice {
    // built single-threaded, read again only by the reaper once it is the
    // sole holder; downstream consumers never look inside
    words: Mutex<hashbrown::HashMap<u32, WordRef, ahash::RandomState>>,
}

impl WordSlice {
    pub(crate) fn add(&self, word: &WordRef) {
        self.words
            .lock()
            .entry(word.id)
            .or_insert_with(|| Arc::clone(word));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.words.lock().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.words.lock().len()
    }

    pub(crate) fn drain(&self) -> Vec<WordRef> {
        self.words.lock().drain().map(|(_, w)| w).collect()
    }
}

/// A permanently-interned tag-name word with its precomputed bloom probe
/// hash. Copied into report aggregators at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameWord {
    pub id: u32,
    pub probe_hash: u64,
}

/// Anything that can turn a word into a dictionary id. The repacker
/// implements this with its per-thread cache; the dictionary itself
/// implements it for direct (test and tooling) use.
pub trait WordInterner {
    fn intern(&mut self, word: &str) -> u32;
}

impl WordInterner for &Dictionary {
    fn intern(&mut self, word: &str) -> u32 {
        self.get_or_add(word)
    }
}

// Forward-map key with its hash precomputed; the map's `Hash` impl is
// never used since all access goes through the raw shard API.
struct WordKey {
    text: Arc<str>,
    hash: u64,
}

impl Hash for WordKey {
    fn hash<H: Hasher>(&self, _state: &mut H) {
        // hash is computed once in word_hash() and carried alongside
        unreachable!();
    }
}

impl Eq for WordKey {}
impl PartialEq for WordKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.text == other.text
    }
}

struct WordData {
    id: u32,
    refs: AtomicU32,
}

#[derive(Default)]
struct IdTable {
    // index = id - 1; id 0 is the reserved empty word
    words: Vec<Option<Arc<str>>>,
    free_ids: Vec<u32>,
    strings_bytes: usize,
}

impl IdTable {
    fn alloc(&mut self, text: Arc<str>) -> u32 {
        self.strings_bytes += text.len();
        if let Some(id) = self.free_ids.pop() {
            self.words[(id - 1) as usize] = Some(text);
            id
        } else {
            self.words.push(Some(text));
            u32::try_from(self.words.len()).unwrap_or(u32::MAX)
        }
    }

    fn release(&mut self, id: u32) {
        let slot = &mut self.words[(id - 1) as usize];
        if let Some(text) = slot.take() {
            self.strings_bytes -= text.len();
            self.free_ids.push(id);
        }
    }

    fn get(&self, id: u32) -> Option<Arc<str>> {
        self.words.get((id - 1) as usize)?.clone()
    }
}

/// Point-in-time dictionary usage numbers for the stats surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct DictionaryStats {
    pub size: u64,
    pub mem_hash: u64,
    pub mem_list: u64,
    pub mem_strings: u64,
    pub lookup_count: u64,
    pub insert_count: u64,
}

/// The shared dictionary. Forward map is sharded by the high bits of the
/// word hash, one rw-lock per shard; the reverse id table and the
/// (write-mostly) nameword table are separate locks.
pub struct Dictionary {
    words: DashMap<WordKey, WordData, ahash::RandomState>,
    by_id: RwLock<IdTable>,
    namewords: RwLock<hashbrown::HashMap<Arc<str>, (NameWord, WordRef), ahash::RandomState>>,

    size: AtomicUsize,
    lookup_count: AtomicU64,
    insert_count: AtomicU64,
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl Dictionary {
    #[must_use]
    pub fn new() -> Self {
        Self {
            words: DashMap::with_hasher(ahash::RandomState::new()),
            by_id: RwLock::new(IdTable::default()),
            namewords: RwLock::new(hashbrown::HashMap::default()),
            size: AtomicUsize::new(0),
            lookup_count: AtomicU64::new(0),
            insert_count: AtomicU64::new(0),
        }
    }

    /// Number of live words.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the id for `word`, interning it first if needed. Does not
    /// touch the reference count: the caller either already holds a
    /// word-slice reference or is about to take one.
    pub fn get_or_add(&self, word: &str) -> u32 {
        if word.is_empty() {
            return 0;
        }
        self.get_or_add_impl(word, word_hash(word), false).0
    }

    /// Returns a word handle and increments the global reference count.
    /// Called by the repacker cache on miss; the handle ends up in a
    /// word-slice and the reference is released through
    /// [`Dictionary::erase_word_ref`] when the slice is reaped.
    pub fn get_or_add_ref(&self, word: &str, hash: u64) -> WordRef {
        let (id, text) = self.get_or_add_impl(word, hash, true);
        Arc::new(Word { id, hash, text })
    }

    fn get_or_add_impl(&self, word: &str, hash: u64, add_ref: bool) -> (u32, Arc<str>) {
        self.lookup_count.fetch_add(1, Ordering::Relaxed);

        #[allow(clippy::cast_possible_truncation)]
        let shard = self.words.determine_shard(hash as usize);
        // SAFETY: determine_shard always returns an in-range index
        let shard_lock = unsafe { self.words.shards().get_unchecked(shard) };

        // fastpath: read lock only
        {
            let guard = shard_lock.read();
            let found = guard.find(hash, |(k, _)| k.hash == hash && k.text.as_ref() == word);
            if let Some(bucket) = found {
                // SAFETY: holding the shard read lock, no concurrent writer
                let (key, value) = unsafe { bucket.as_ref() };
                let data = value.get();
                if add_ref {
                    data.refs.fetch_add(1, Ordering::Relaxed);
                }
                return (data.id, Arc::clone(&key.text));
            }
        }

        let mut guard = shard_lock.write();
        let search_result = guard.find_or_find_insert_slot(
            hash,
            |(k, _)| k.hash == hash && k.text.as_ref() == word,
            |(k, _)| k.hash,
        );

        match search_result {
            Ok(bucket) => {
                // SAFETY: holding the shard write lock
                let (key, value) = unsafe { bucket.as_ref() };
                let data = value.get();
                if add_ref {
                    data.refs.fetch_add(1, Ordering::Relaxed);
                }
                (data.id, Arc::clone(&key.text))
            }
            Err(insert_slot) => {
                let text: Arc<str> = Arc::from(word);
                let id = self.by_id.write().alloc(Arc::clone(&text));

                let key = WordKey {
                    text: Arc::clone(&text),
                    hash,
                };
                let data = WordData {
                    id,
                    refs: AtomicU32::new(u32::from(add_ref)),
                };
                // SAFETY: slot obtained from find_or_find_insert_slot above
                // while continuously holding the write lock
                unsafe {
                    guard.insert_in_slot(hash, insert_slot, (key, SharedValue::new(data)));
                }

                self.size.fetch_add(1, Ordering::Relaxed);
                self.insert_count.fetch_add(1, Ordering::Relaxed);
                (id, text)
            }
        }
    }

    /// Reverse lookup. Returns `None` for id 0 and ids that are not (or no
    /// longer) live; the caller must hold a reference transitively to rely
    /// on the result.
    #[must_use]
    pub fn get_word(&self, id: u32) -> Option<Arc<str>> {
        if id == 0 {
            return None;
        }
        self.by_id.read().get(id)
    }

    /// Releases one global reference to `id`. When the count reaches zero
    /// the word is removed and the id becomes reusable.
    pub fn erase_word_ref(&self, id: u32) {
        let Some(text) = ({
            let table = self.by_id.read();
            table.get(id)
        }) else {
            tracing::warn!("erase_word_ref: unknown word id {id}");
            return;
        };

        let hash = word_hash(&text);
        #[allow(clippy::cast_possible_truncation)]
        let shard = self.words.determine_shard(hash as usize);
        // SAFETY: determine_shard always returns an in-range index
        let shard_lock = unsafe { self.words.shards().get_unchecked(shard) };

        let mut guard = shard_lock.write();
        let found = guard.find(hash, |(k, _)| k.hash == hash && k.text == text);
        let Some(bucket) = found else {
            tracing::warn!("erase_word_ref: word id {id} not in forward map");
            return;
        };

        // SAFETY: holding the shard write lock
        let (_, value) = unsafe { bucket.as_ref() };
        let prev = value.get().refs.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev >= 1);

        if prev == 1 {
            // SAFETY: bucket was found under the same continuously-held lock
            unsafe {
                guard.remove(bucket);
            }
            drop(guard);

            self.by_id.write().release(id);
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Interns a tag-name word that is held for the lifetime of the
    /// dictionary (name words are referenced from report configurations
    /// and are never reaped), with its bloom probe hash precomputed.
    pub fn add_nameword(&self, word: &str) -> NameWord {
        if word.is_empty() {
            return NameWord {
                id: 0,
                probe_hash: 0,
            };
        }

        if let Some((nameword, _)) = self.namewords.read().get(word) {
            return *nameword;
        }

        let word_ref = self.get_or_add_ref(word, word_hash(word));
        let nameword = NameWord {
            id: word_ref.id,
            probe_hash: bloom_hash(word_ref.id),
        };

        let mut table = self.namewords.write();
        // racing adders both hold a global ref; keeping one entry is enough
        table
            .entry(Arc::clone(&word_ref.text))
            .or_insert((nameword, word_ref))
            .0
    }

    /// Memory estimator for the stats surface.
    #[must_use]
    pub fn stats(&self) -> DictionaryStats {
        let mut hash_capacity = 0usize;
        for shard in self.words.shards() {
            hash_capacity += shard.read().capacity();
        }

        let (list_capacity, strings_bytes) = {
            let table = self.by_id.read();
            (table.words.capacity(), table.strings_bytes)
        };

        DictionaryStats {
            size: self.len() as u64,
            mem_hash: (hash_capacity * (size_of::<WordKey>() + size_of::<SharedValue<WordData>>()))
                as u64,
            mem_list: (list_capacity * size_of::<Option<Arc<str>>>()) as u64,
            mem_strings: strings_bytes as u64,
            lookup_count: self.lookup_count.load(Ordering::Relaxed),
            insert_count: self.insert_count.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn memory_used(&self) -> u64 {
        let s = self.stats();
        s.mem_hash + s.mem_list + s.mem_strings
    }
}
