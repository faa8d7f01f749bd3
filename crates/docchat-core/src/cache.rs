//! Bounded, concurrency-safe cache of recent chat turns.
//!
//! The cache is derived state: every turn it holds was first written to the
//! durable message store, so a miss is always recoverable by reading that
//! store and calling [`ChatContextCache::prime`].
//!
//! Locking is split in two levels:
//!
//! - a recency index (`LruCache`) behind a short-lived mutex, touched only
//!   to look up, insert or evict an entry handle;
//! - one mutex per chat, held while that chat's turns are read or changed.
//!
//! Mutations of one chat are serialized by its own mutex. Two different
//! chats only ever meet on the O(1) index lookup and never wait on each
//! other's turn lists.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use lru::LruCache;

use crate::models::{Message, Turn};

/// Recent history of one chat, oldest turn first.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatContext {
    pub chat_id: String,
    pub turns: VecDeque<Turn>,
    pub last_access: DateTime<Utc>,
}

impl ChatContext {
    fn empty(chat_id: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            turns: VecDeque::new(),
            last_access: Utc::now(),
        }
    }

    /// The most recent turn, if any.
    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.back()
    }

    fn push(&mut self, turn: Turn, max_turns: usize) {
        self.turns.push_back(turn);
        while self.turns.len() > max_turns {
            self.turns.pop_front();
        }
    }
}

/// Counters exposed for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

type Entry = Arc<Mutex<ChatContext>>;

pub struct ChatContextCache {
    index: Mutex<LruCache<String, Entry>>,
    max_turns: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// A poisoned lock only means another thread panicked mid-update of a
/// disposable cache entry; the data is still structurally valid.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChatContextCache {
    /// Create a cache holding at most `max_chats` chats of at most
    /// `max_turns` turns each.
    pub fn new(max_chats: usize, max_turns: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(max_chats)
            .ok_or_else(|| anyhow!("Invalid max_chats: must be > 0"))?;
        if max_turns == 0 {
            return Err(anyhow!("Invalid max_turns: must be > 0"));
        }
        Ok(Self {
            index: Mutex::new(LruCache::new(capacity)),
            max_turns,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Look up a chat's recent history. Refreshes recency on a hit and
    /// never creates an entry.
    pub fn get_context(&self, chat_id: &str) -> Option<ChatContext> {
        let entry = lock(&self.index).get(chat_id).cloned();
        match entry {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let mut ctx = lock(&entry);
                ctx.last_access = Utc::now();
                Some(ctx.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Append one user/assistant pair, creating the entry if needed.
    ///
    /// Returns the context as it stands right after the append.
    pub fn add_turn(&self, chat_id: &str, user: Message, assistant: Message) -> ChatContext {
        let entry = self.entry_or_insert(chat_id, None);
        let mut ctx = lock(&entry);
        ctx.push(Turn::new(user, assistant), self.max_turns);
        ctx.last_access = Utc::now();
        ctx.clone()
    }

    /// Seed a chat from durable history after a miss.
    ///
    /// Only the newest `max_turns` turns are kept. A chat that gained an
    /// entry in the meantime is left as is.
    pub fn prime(&self, chat_id: &str, turns: Vec<Turn>) -> ChatContext {
        let entry = self.entry_or_insert(chat_id, Some(turns));
        let mut ctx = lock(&entry);
        ctx.last_access = Utc::now();
        ctx.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.index).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, chat_id: &str) -> bool {
        lock(&self.index).contains(chat_id)
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn entry_or_insert(&self, chat_id: &str, seed: Option<Vec<Turn>>) -> Entry {
        let mut index = lock(&self.index);
        if let Some(existing) = index.get(chat_id) {
            return existing.clone();
        }

        let mut ctx = ChatContext::empty(chat_id);
        for turn in seed.into_iter().flatten() {
            ctx.push(turn, self.max_turns);
        }
        let entry = Arc::new(Mutex::new(ctx));
        if let Some((evicted, _)) = index.push(chat_id.to_string(), entry.clone()) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(chat_id = %evicted, "evicted chat context");
        }
        entry
    }
}
