//! Repacker pool: raw records → packets, plus the per-thread dictionary
//! cache and the word-slice reclamation protocol.
//!
//! Each worker owns a [`RepackerDict`]: a stored-hash cache mapping every
//! string it has seen to a [`WordRef`], so a distinct string costs at most
//! one global dictionary call per thread per slice lifetime. Every lookup
//! also registers the word in the current word-slice; sealed packet
//! batches embed that slice, which is how downstream consumers keep the
//! words alive. Once per second the current slice is sealed and
//! [`RepackerDict::reap_unused_wordslices`] releases dictionary references
//! for words whose slices no downstream consumer holds anymore.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, tick, Receiver, Sender, TrySendError};
use crossbeam::select;
use hashbrown::hash_map::RawEntryMut;
use tracing::{debug, warn};

use crate::dictionary::{word_hash, Dictionary, WordInterner, WordRef, WordSlice};
use crate::error::PinbaError;
use crate::packet::{request_to_packet, validate_request, PacketBatch, RawBatch, RepackScratch};
use crate::stats::{add, inc, thread_rusage, Stats};

/// Repacker pool configuration.
#[derive(Debug, Clone)]
pub struct RepackerConfig {
    pub n_threads: u32,
    /// Packets per sealed batch.
    pub batch_size: u32,
    /// Max time a batch stays open before it is sealed anyway.
    pub batch_timeout: Duration,
}

impl Default for RepackerConfig {
    fn default() -> Self {
        Self {
            n_threads: 4,
            batch_size: 256,
            batch_timeout: Duration::from_millis(100),
        }
    }
}

/// Counters returned by one reclamation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub reaped_slices: u64,
    pub reaped_words_local: u64,
    pub reaped_words_global: u64,
}

/// Single-threaded dictionary cache for one repacker worker.
pub struct RepackerDict {
    dict: Arc<Dictionary>,
    // string -> word handle, addressed with precomputed hashes; the
    // fixed-seed hasher keeps stored hashes valid across rehashes
    cache: hashbrown::HashMap<Arc<str>, WordRef, ahash::RandomState>,

    sealed: VecDeque<Arc<WordSlice>>,
    current: Arc<WordSlice>,
}

impl RepackerDict {
    #[must_use]
    pub fn new(dict: Arc<Dictionary>) -> Self {
        Self {
            dict,
            cache: hashbrown::HashMap::with_hasher(crate::dictionary::word_hasher()),
            sealed: VecDeque::new(),
            current: Arc::new(WordSlice::default()),
        }
    }

    /// Cache-first word interning; every hit or miss registers the word in
    /// the current word-slice.
    pub fn get_or_add(&mut self, word: &str) -> u32 {
        if word.is_empty() {
            return 0;
        }

        let hash = word_hash(word);

        match self
            .cache
            .raw_entry_mut()
            .from_hash(hash, |k| k.as_ref() == word)
        {
            RawEntryMut::Occupied(entry) => {
                let w = entry.get();
                self.current.add(w);
                w.id
            }
            RawEntryMut::Vacant(entry) => {
                let w = self.dict.get_or_add_ref(word, hash);
                self.current.add(&w);
                let id = w.id;
                entry.insert_hashed_nocheck(hash, Arc::clone(&w.text), w);
                id
            }
        }
    }

    /// The slice to embed into batches sealed right now.
    #[must_use]
    pub fn current_wordslice(&self) -> Arc<WordSlice> {
        Arc::clone(&self.current)
    }

    /// Seals the current slice (if it saw any words) and opens a fresh one.
    pub fn start_new_wordslice(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let old = mem::replace(&mut self.current, Arc::new(WordSlice::default()));
        self.sealed.push_back(old);
    }

    /// Reaps every sealed slice whose only remaining holder is this cache:
    /// words referenced by nothing but the slice and the cache are removed
    /// from the cache and their dictionary reference is released.
    pub fn reap_unused_wordslices(&mut self) -> ReapStats {
        let mut stats = ReapStats::default();

        let mut kept = VecDeque::with_capacity(self.sealed.len());
        let mut reapable = Vec::new();
        for ws in self.sealed.drain(..) {
            if Arc::strong_count(&ws) == 1 {
                reapable.push(ws);
            } else {
                kept.push_back(ws);
            }
        }
        self.sealed = kept;

        if reapable.is_empty() {
            return stats;
        }

        let mut words_to_erase: Vec<WordRef> = Vec::new();

        for ws in reapable {
            stats.reaped_slices += 1;

            // process slice-by-slice: handles of still-shared words must be
            // dropped before the next slice is examined, so its strong
            // counts are accurate
            for w in ws.drain() {
                debug_assert!(Arc::strong_count(&w) >= 2);

                if Arc::strong_count(&w) == 2 {
                    // only this handle and the cache remain
                    if let RawEntryMut::Occupied(entry) = self
                        .cache
                        .raw_entry_mut()
                        .from_hash(w.hash, |k| k.as_ref() == w.text.as_ref())
                    {
                        entry.remove();
                    }
                    stats.reaped_words_local += 1;
                    words_to_erase.push(w);
                } else {
                    stats.reaped_words_local += 1;
                }
            }
        }

        // release in the upstream dictionary; word ids are unique among
        // live words, so this cannot collide with a reissued id
        stats.reaped_words_global = words_to_erase.len() as u64;
        for w in &words_to_erase {
            self.dict.erase_word_ref(w.id);
        }

        stats
    }

    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn sealed_slices(&self) -> usize {
        self.sealed.len()
    }
}

impl WordInterner for RepackerDict {
    fn intern(&mut self, word: &str) -> u32 {
        self.get_or_add(word)
    }
}

/// The repacker thread pool.
pub struct Repacker {
    threads: Vec<JoinHandle<()>>,
    shutdown_tx: Option<Sender<()>>,
}

impl Repacker {
    /// Spawns `n_threads` workers consuming raw batches from `input` and
    /// publishing packet batches to `output`.
    ///
    /// # Errors
    /// Returns an error when thread spawning fails.
    pub fn start(
        conf: &RepackerConfig,
        dictionary: &Arc<Dictionary>,
        input: &Receiver<RawBatch>,
        output: &Sender<Arc<PacketBatch>>,
        stats: &Arc<Stats>,
    ) -> Result<Self, PinbaError> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        stats
            .repacker_threads
            .lock()
            .resize(conf.n_threads as usize, Default::default());

        let mut threads = Vec::with_capacity(conf.n_threads as usize);
        for i in 0..conf.n_threads {
            let conf = conf.clone();
            let dictionary = Arc::clone(dictionary);
            let input = input.clone();
            let output = output.clone();
            let shutdown_rx = shutdown_rx.clone();
            let stats = Arc::clone(stats);

            let handle = std::thread::Builder::new()
                .name(format!("repacker/{i}"))
                .spawn(move || {
                    worker(i, &conf, dictionary, &input, &output, &shutdown_rx, &stats);
                    debug!("repacker/{i}; exiting");
                })?;
            threads.push(handle);
        }

        Ok(Self {
            threads,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Signals every worker and joins them. Idempotent.
    pub fn shutdown(&mut self) {
        drop(self.shutdown_tx.take());
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("repacker worker panicked");
            }
        }
    }
}

impl Drop for Repacker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum SealCause {
    BySize,
    ByTimer,
}

#[allow(clippy::too_many_lines)]
fn worker(
    thread_id: u32,
    conf: &RepackerConfig,
    dictionary: Arc<Dictionary>,
    input: &Receiver<RawBatch>,
    output: &Sender<Arc<PacketBatch>>,
    shutdown_rx: &Receiver<()>,
    stats: &Arc<Stats>,
) {
    let batch_size = conf.batch_size as usize;

    let mut rd = RepackerDict::new(dictionary);
    let mut scratch = RepackScratch::default();
    let mut batch = PacketBatch::with_capacity(batch_size);
    let mut batch_opened = Instant::now();

    let slice_tick = tick(Duration::from_secs(1));

    let seal = |batch: &mut PacketBatch, rd: &RepackerDict, cause: &SealCause| {
        let mut sealed = mem::replace(batch, PacketBatch::with_capacity(batch_size));
        sealed.wordslice = Some(rd.current_wordslice());

        inc(&stats.repacker.batch_send_total);
        match cause {
            SealCause::BySize => inc(&stats.repacker.batch_send_by_size),
            SealCause::ByTimer => inc(&stats.repacker.batch_send_by_timer),
        }

        match output.try_send(Arc::new(sealed)) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                inc(&stats.repacker.batch_send_err);
            }
        }
    };

    loop {
        inc(&stats.repacker.poll_total);

        let batch_wait = if batch.is_empty() {
            conf.batch_timeout
        } else {
            conf.batch_timeout.saturating_sub(batch_opened.elapsed())
        };

        select! {
            recv(input) -> msg => {
                let Ok(mut raw) = msg else {
                    // collectors are gone, nothing more will arrive
                    break;
                };

                inc(&stats.repacker.recv_total);
                add(&stats.repacker.recv_packets, raw.len() as u64);

                for request in &mut raw.requests {
                    if let Err(e) = validate_request(request) {
                        inc(&stats.repacker.packet_validate_err);
                        debug!("request validation failed: {}", e.as_str());
                        continue;
                    }

                    if batch.is_empty() {
                        batch_opened = Instant::now();
                    }
                    request_to_packet(request, &mut rd, &mut scratch, &mut batch);

                    if batch.len() >= batch_size {
                        seal(&mut batch, &rd, &SealCause::BySize);
                        batch_opened = Instant::now();
                    }
                }
            },
            recv(shutdown_rx) -> _ => break,
            recv(slice_tick) -> _ => {
                // seal first so the open batch still references the slice
                // it interned into, then rotate and reap
                if !batch.is_empty() {
                    seal(&mut batch, &rd, &SealCause::ByTimer);
                    batch_opened = Instant::now();
                }

                rd.start_new_wordslice();
                let reaped = rd.reap_unused_wordslices();
                if reaped.reaped_slices > 0 {
                    debug!(
                        "repacker/{thread_id}; reaped slices: {}, words: {}/{} (local/global)",
                        reaped.reaped_slices,
                        reaped.reaped_words_local,
                        reaped.reaped_words_global,
                    );
                }

                let ru = thread_rusage();
                stats.repacker_threads.lock()[thread_id as usize] = ru;
            },
            default(batch_wait) => {
                inc(&stats.repacker.recv_eagain);
                if !batch.is_empty() {
                    seal(&mut batch, &rd, &SealCause::ByTimer);
                }
                batch_opened = Instant::now();
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict() -> Arc<Dictionary> {
        Arc::new(Dictionary::new())
    }

    #[test]
    fn test_cache_hits_avoid_dictionary_calls() {
        let d = dict();
        let mut rd = RepackerDict::new(Arc::clone(&d));

        let a = rd.get_or_add("hello");
        let lookups_after_first = d.stats().lookup_count;
        let b = rd.get_or_add("hello");
        let lookups_after_second = d.stats().lookup_count;

        assert_eq!(a, b);
        assert_eq!(lookups_after_first, lookups_after_second);
        assert_eq!(rd.cache_len(), 1);
    }

    #[test]
    fn test_reap_removes_unreferenced_words() {
        let d = dict();
        let mut rd = RepackerDict::new(Arc::clone(&d));

        let id = rd.get_or_add("ephemeral");
        assert_eq!(d.get_word(id).as_deref(), Some("ephemeral"));

        rd.start_new_wordslice();
        let stats = rd.reap_unused_wordslices();

        assert_eq!(stats.reaped_slices, 1);
        assert_eq!(stats.reaped_words_global, 1);
        assert_eq!(rd.cache_len(), 0);
        assert!(d.get_word(id).is_none());
    }

    #[test]
    fn test_reap_keeps_downstream_referenced_slices() {
        let d = dict();
        let mut rd = RepackerDict::new(Arc::clone(&d));

        let id = rd.get_or_add("held");
        let held_slice = rd.current_wordslice(); // simulates a batch in flight
        rd.start_new_wordslice();

        let stats = rd.reap_unused_wordslices();
        assert_eq!(stats.reaped_slices, 0);
        assert_eq!(d.get_word(id).as_deref(), Some("held"));
        assert_eq!(rd.sealed_slices(), 1);

        // downstream drops its reference: next reap removes the word
        drop(held_slice);
        let stats = rd.reap_unused_wordslices();
        assert_eq!(stats.reaped_slices, 1);
        assert!(d.get_word(id).is_none());
    }

    #[test]
    fn test_word_seen_in_later_slice_survives_earlier_reap() {
        let d = dict();
        let mut rd = RepackerDict::new(Arc::clone(&d));

        let id = rd.get_or_add("sticky");
        rd.start_new_wordslice();

        // seen again in the (new) current slice
        assert_eq!(rd.get_or_add("sticky"), id);

        let stats = rd.reap_unused_wordslices();
        assert_eq!(stats.reaped_slices, 1);
        assert_eq!(stats.reaped_words_global, 0, "current slice still holds it");
        assert_eq!(d.get_word(id).as_deref(), Some("sticky"));
        assert_eq!(rd.cache_len(), 1);
    }

    #[test]
    fn test_id_reuse_after_full_reclaim() {
        let d = dict();
        let mut rd = RepackerDict::new(Arc::clone(&d));

        let id = rd.get_or_add("x");
        rd.start_new_wordslice();
        rd.reap_unused_wordslices();
        assert!(d.get_word(id).is_none());

        // reissued (same or fresh id), resolvable either way
        let id2 = rd.get_or_add("x");
        assert_eq!(d.get_word(id2).as_deref(), Some("x"));
    }
}
