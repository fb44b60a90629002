//! In-memory checksum to buffer cache with reference counting.
//!
//! Buffers enter the cache either unreferenced, through [`BufferCache::cache`], or referenced,
//! through [`BufferCache::incref`] and [`BufferCache::incref_buffer`]. A reference is held by a
//! [`BufferRef`] guard; dropping the guard releases it.
//!
//! Resident buffers are evicted by a background actor. An unreferenced buffer stays in memory
//! for `lifetime_temp_small` if it is smaller than `small_buffer_limit` bytes, otherwise for
//! `lifetime_temp`. The timer is re-armed when the buffer is used. A referenced buffer is only
//! evicted if the remote tier can serve it again, unless full local persistence is disabled
//! and the reference is not persistent.
//!
//! A referenced checksum whose buffer is not available is recorded as missing. Whenever its
//! buffer shows up, through any path, the missing entry is resolved; if it was expected to be
//! persistent, the buffer is uploaded to the write server.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::Bytes;
use futures_lite::StreamExt;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinSet, time::Instant};
use tokio_util::time::DelayQueue;
use tracing::{debug, error_span, trace, warn, Instrument};

use crate::{
    buffer_info::{BufferInfo, BufferInfoStore, Field, JsonType},
    celltype::Celltype,
    checksum::{Buffer, Checksum},
    config::BufferConfig,
    digest_cache::DigestCache,
    error::CacheMiss,
    remote::RemoteBufferLayer,
    value::{MAGIC_NUMPY, MAGIC_SEAMLESS_MIXED},
};

mod invariants;

/// Length assumed for buffers of unknown size when picking a lifetime.
const UNKNOWN_LENGTH: u64 = 999_999_999;

/// Checksum to buffer cache. Clones share the cache.
#[derive(Debug, Clone)]
pub struct BufferCache {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    state: Mutex<State>,
    digests: DigestCache,
    remote: RemoteBufferLayer,
    infos: Arc<BufferInfoStore>,
    config: BufferConfig,
    #[debug(skip)]
    evict_tx: mpsc::UnboundedSender<Message>,
}

#[derive(derive_more::Debug, Default)]
struct State {
    #[debug("{} buffers", buffers.len())]
    buffers: HashMap<Checksum, Buffer>,
    /// Last use of each resident buffer that has an eviction timer.
    #[debug(skip)]
    last_time: HashMap<Checksum, Instant>,
    refcounts: HashMap<Checksum, usize>,
    /// Referenced checksums without a buffer, with whether they are expected to persist.
    missing: HashMap<Checksum, bool>,
    /// Persistent references, only tracked without full local persistence.
    persistent: HashSet<Checksum>,
    destroyed: bool,
}

/// Messages for the eviction actor.
#[derive(Debug)]
enum Message {
    /// Check the buffer for eviction after `delay`.
    Expire { checksum: Checksum, delay: Duration },
}

/// A buffer that must be sent to the write server.
#[derive(Debug)]
#[must_use]
struct Upload {
    checksum: Checksum,
    buffer: Buffer,
}

/// Outcome of an eviction check.
#[derive(Debug, PartialEq, Eq)]
enum Expiry {
    /// Nothing to do.
    Gone,
    /// Used again since; check again after the delay.
    Rearm(Duration),
    /// Evicted.
    Evicted,
    /// Referenced: evict only if the remote tier has it.
    AskRemote,
}

/// A counted reference to a checksum. Dropping it releases the reference.
#[derive(derive_more::Debug)]
#[must_use = "dropping the guard releases the reference"]
pub struct BufferRef {
    checksum: Checksum,
    #[debug(skip)]
    cache: Weak<Inner>,
}

impl BufferRef {
    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        if let Some(inner) = self.cache.upgrade() {
            inner.decref(&self.checksum);
        }
    }
}

impl BufferCache {
    /// Creates the cache and spawns its eviction actor on the current runtime.
    pub fn new(
        config: BufferConfig,
        remote: RemoteBufferLayer,
        infos: Arc<BufferInfoStore>,
    ) -> Self {
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            digests: DigestCache::default(),
            remote,
            infos,
            config,
            evict_tx,
        });
        let actor = EvictionActor {
            cache: Arc::downgrade(&inner),
            msg_rx: evict_rx,
            queue: DelayQueue::new(),
            remote_checks: JoinSet::new(),
        };
        tokio::spawn(actor.run().instrument(error_span!("buffer_cache")));
        Self { inner }
    }

    pub fn remote(&self) -> &RemoteBufferLayer {
        &self.inner.remote
    }

    pub fn buffer_info(&self) -> &Arc<BufferInfoStore> {
        &self.inner.infos
    }

    pub fn digests(&self) -> &DigestCache {
        &self.inner.digests
    }

    /// Gets a buffer from the constants, the digest cache, memory and, if `remote`, from
    /// the remote tiers. Never fails; a buffer that cannot be found is `None`.
    pub async fn get(&self, checksum: &Checksum, remote: bool) -> Option<Buffer> {
        if let Some(buffer) = self.get_local(checksum) {
            return Some(buffer);
        }
        if !remote {
            return None;
        }
        let buffer = self.inner.remote.get_buffer(checksum).await?;
        self.cache(checksum, buffer.clone()).await;
        Some(buffer)
    }

    /// Gets a buffer without touching the remote tiers.
    pub fn get_local(&self, checksum: &Checksum) -> Option<Buffer> {
        if let Some(constant) = checksum.constant_buffer() {
            return Some(Buffer::with_checksum(Bytes::from_static(constant), *checksum));
        }
        if let Some(buffer) = self.inner.digests.get(checksum) {
            return Some(buffer);
        }
        let mut state = self.inner.state.lock();
        let buffer = state.buffers.get(checksum).cloned()?;
        if let Some(t) = state.last_time.get_mut(checksum) {
            *t = Instant::now();
        }
        Some(buffer)
    }

    /// Keeps a buffer in memory for a short while, without referencing it.
    ///
    /// The checksum may be referenced later without providing the buffer again.
    pub async fn cache(&self, checksum: &Checksum, buffer: Buffer) {
        let upload = {
            let mut state = self.inner.state.lock();
            self.inner.cache_locked(&mut state, checksum, buffer)
        };
        self.inner.upload(upload).await;
    }

    /// Resolves a missing checksum with a buffer that just became available.
    pub async fn find_missing(&self, checksum: &Checksum, buffer: Option<Buffer>) {
        let upload = {
            let mut state = self.inner.state.lock();
            self.inner
                .find_missing_locked(&mut state, checksum, buffer, false)
        };
        self.inner.upload(upload).await;
    }

    /// References a checksum together with its buffer.
    pub async fn incref_buffer(
        &self,
        checksum: &Checksum,
        buffer: Buffer,
        persistent: bool,
    ) -> BufferRef {
        self.inner.infos.update_local(checksum, Field::Length(buffer.len() as u64));
        self.incref_inner(checksum, persistent, Some(buffer)).await
    }

    /// References a checksum.
    ///
    /// If the buffer is not available it is recorded as missing. A persistent reference
    /// moves the buffer to the write server when there is one.
    pub async fn incref(&self, checksum: &Checksum, persistent: bool) -> BufferRef {
        self.incref_inner(checksum, persistent, None).await
    }

    async fn incref_inner(
        &self,
        checksum: &Checksum,
        persistent: bool,
        buffer: Option<Buffer>,
    ) -> BufferRef {
        let upload = {
            let mut state = self.inner.state.lock();
            let upload = self
                .inner
                .incref_locked(&mut state, checksum, persistent, buffer);
            #[cfg(any(test, debug_assertions))]
            state.check_invariants();
            upload
        };
        self.inner.upload(upload).await;
        BufferRef {
            checksum: *checksum,
            cache: Arc::downgrade(&self.inner),
        }
    }

    /// Releases a reference taken without a guard, see [`BufferRef`].
    pub fn decref(&self, checksum: &Checksum) {
        self.inner.decref(checksum);
    }

    /// Number of references to a checksum.
    pub fn refcount(&self, checksum: &Checksum) -> usize {
        self.inner
            .state
            .lock()
            .refcounts
            .get(checksum)
            .copied()
            .unwrap_or(0)
    }

    /// Checksums with a persistent reference.
    ///
    /// Always empty with full local persistence, where every reference keeps its buffer.
    pub fn persistent_buffers(&self) -> Vec<Checksum> {
        let mut checksums: Vec<_> = self.inner.state.lock().persistent.iter().copied().collect();
        checksums.sort();
        checksums
    }

    /// True if the checksum is referenced but its buffer was never seen.
    pub fn is_missing(&self, checksum: &Checksum) -> bool {
        self.inner.state.lock().missing.contains_key(checksum)
    }

    /// True if the buffer is held in memory.
    pub fn is_resident(&self, checksum: &Checksum) -> bool {
        self.inner.state.lock().buffers.contains_key(checksum)
    }

    /// True if the buffer is in memory or a remote tier can serve it.
    pub async fn buffer_check(&self, checksum: &Checksum) -> bool {
        if checksum.constant_buffer().is_some() || self.is_resident(checksum) {
            return true;
        }
        self.inner.remote.can_read_buffer(checksum).await
    }

    /// Gets the buffer info of a checksum.
    ///
    /// With `sync_remote`, the record is first merged with the database copy. With
    /// `force_length`, the length is determined from the buffer if needed, looking it up
    /// remotely only if `buffer_from_remote` is set; failure to get it is a cache miss.
    pub async fn get_buffer_info(
        &self,
        checksum: &Checksum,
        sync_remote: bool,
        buffer_from_remote: bool,
        force_length: bool,
    ) -> Result<BufferInfo, CacheMiss> {
        let info = self.inner.infos.get(checksum, sync_remote).await;
        if !force_length || info.length.is_some() {
            return Ok(info);
        }
        let remotes: &[bool] = if buffer_from_remote { &[false, true] } else { &[false] };
        for remote in remotes {
            if let Some(buffer) = self.get(checksum, *remote).await {
                self.inner
                    .infos
                    .update_local(checksum, Field::Length(buffer.len() as u64));
                if sync_remote {
                    self.inner.infos.sync_to_remote(checksum).await;
                }
                return Ok(self.inner.infos.get_local(checksum).unwrap_or_default());
            }
        }
        Err(CacheMiss::new(*checksum))
    }

    /// Records a piece of buffer info.
    pub async fn update_buffer_info(&self, checksum: &Checksum, field: Field, sync_remote: bool) {
        self.inner.infos.update(checksum, field, sync_remote).await;
    }

    /// Records that the buffer is surely valid for `celltype`.
    ///
    /// For `mixed`, the buffer is inspected if it is available locally.
    pub async fn guarantee_buffer_info(
        &self,
        checksum: &Checksum,
        celltype: Celltype,
        buffer: Option<&Buffer>,
        sync_to_remote: bool,
    ) {
        use Celltype as C;
        let celltype = match celltype {
            C::Bytes | C::Checksum => return,
            C::Ipython | C::Python | C::Cson | C::Yaml => C::Text,
            other => other,
        };
        let infos = &self.inner.infos;
        let buffer = match buffer {
            Some(buffer) => Some(buffer.clone()),
            None => self.get_local(checksum),
        };
        if infos.get_local(checksum).is_none() {
            if let Some(buffer) = &buffer {
                infos.update_local(checksum, Field::Length(buffer.len() as u64));
            }
        }
        let field = match celltype {
            C::Mixed => match &buffer {
                Some(b) if b.starts_with(MAGIC_NUMPY) => Some(Field::IsNumpy(true)),
                Some(b) if b.starts_with(MAGIC_SEAMLESS_MIXED) => {
                    Some(Field::IsSeamlessMixed(true))
                }
                Some(_) => Some(Field::IsJson(true)),
                None => None,
            },
            C::Binary => Some(Field::IsNumpy(true)),
            C::Plain => Some(Field::IsJson(true)),
            C::Text => Some(Field::IsUtf8(true)),
            C::Str => Some(Field::JsonType(JsonType::Str)),
            C::Int => Some(Field::JsonType(JsonType::Int)),
            C::Float => Some(Field::JsonType(JsonType::Float)),
            C::Bool => Some(Field::JsonType(JsonType::Bool)),
            _ => None,
        };
        if let Some(field) = field {
            infos.update_local(checksum, field);
        }
        if sync_to_remote && infos.get_local(checksum).is_some() {
            infos.sync_to_remote(checksum).await;
        }
    }

    /// Drops every buffer, warning about references that were never released.
    pub fn destroy(&self) {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return;
        }
        if !state.refcounts.is_empty() {
            warn!("buffer cache, {} buffers undestroyed", state.refcounts.len());
        }
        *state = State {
            destroyed: true,
            ..Default::default()
        };
        self.inner.digests.clear();
    }
}

impl Inner {
    fn lifetime(&self, length: u64) -> Duration {
        if length < self.config.small_buffer_limit as u64 {
            self.config.lifetime_temp_small
        } else {
            self.config.lifetime_temp
        }
    }

    fn send(&self, msg: Message) {
        if let Err(err) = self.evict_tx.send(msg) {
            debug!(msg=?err.0, "eviction message not sent");
        }
    }

    /// Records a use of the buffer, arming its eviction timer if there is none.
    fn touch(&self, state: &mut State, checksum: &Checksum, length: usize) {
        if state.last_time.insert(*checksum, Instant::now()).is_none() {
            let delay = self.lifetime(length as u64);
            self.send(Message::Expire {
                checksum: *checksum,
                delay,
            });
        }
    }

    fn cache_locked(
        &self,
        state: &mut State,
        checksum: &Checksum,
        buffer: Buffer,
    ) -> Option<Upload> {
        if state.destroyed || checksum.constant_buffer().is_some() {
            return None;
        }
        trace!(%checksum, "cache buffer");
        self.touch(state, checksum, buffer.len());
        self.infos
            .update_local(checksum, Field::Length(buffer.len() as u64));
        if !self.remote.is_known(checksum) {
            state.buffers.insert(*checksum, buffer.clone());
        }
        self.find_missing_locked(state, checksum, Some(buffer), false)
    }

    fn find_missing_locked(
        &self,
        state: &mut State,
        checksum: &Checksum,
        buffer: Option<Buffer>,
        persistent: bool,
    ) -> Option<Upload> {
        let expected_persistent = *state.missing.get(checksum)?;
        let buffer = buffer.or_else(|| state.buffers.get(checksum).cloned())?;
        debug!(%checksum, "found missing buffer");
        state.missing.remove(checksum);
        if (persistent || expected_persistent) && !self.remote.is_known(checksum) {
            self.keep_persistent(state, checksum, buffer)
        } else {
            self.cache_locked(state, checksum, buffer)
        }
    }

    /// Keeps a persistent buffer in memory, and schedules its upload if there is a write
    /// server.
    fn keep_persistent(
        &self,
        state: &mut State,
        checksum: &Checksum,
        buffer: Buffer,
    ) -> Option<Upload> {
        self.touch(state, checksum, buffer.len());
        state.buffers.insert(*checksum, buffer.clone());
        if self.remote.can_write() {
            Some(Upload {
                checksum: *checksum,
                buffer,
            })
        } else {
            None
        }
    }

    fn incref_locked(
        &self,
        state: &mut State,
        checksum: &Checksum,
        persistent: bool,
        buffer: Option<Buffer>,
    ) -> Option<Upload> {
        if state.destroyed || checksum.constant_buffer().is_some() {
            return None;
        }
        trace!(%checksum, persistent, "incref");
        if persistent && !self.config.local_mode_full_persistence {
            state.persistent.insert(*checksum);
        }
        *state.refcounts.entry(*checksum).or_insert(0) += 1;
        let buffer = buffer
            .or_else(|| state.buffers.get(checksum).cloned())
            .or_else(|| self.digests.get(checksum));
        match buffer {
            Some(buffer) => {
                if state.missing.contains_key(checksum) {
                    return self.find_missing_locked(state, checksum, Some(buffer), persistent);
                }
                if persistent && !self.remote.is_known(checksum) {
                    self.keep_persistent(state, checksum, buffer)
                } else {
                    self.cache_locked(state, checksum, buffer)
                }
            }
            None => {
                if !self.remote.is_known(checksum) {
                    debug!(%checksum, "incref checksum of missing buffer");
                    let expected = state.missing.entry(*checksum).or_insert(false);
                    *expected |= persistent;
                }
                None
            }
        }
    }

    fn decref(&self, checksum: &Checksum) {
        if checksum.constant_buffer().is_some() {
            return;
        }
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        let Some(count) = state.refcounts.get_mut(checksum) else {
            warn!(%checksum, "double decref");
            return;
        };
        *count -= 1;
        if *count == 0 {
            trace!(%checksum, "last reference released");
            state.refcounts.remove(checksum);
            state.missing.remove(checksum);
            state.persistent.remove(checksum);
            if let Some(len) = state.buffers.get(checksum).map(|b| b.len()) {
                self.touch(&mut state, checksum, len);
            }
        }
        #[cfg(any(test, debug_assertions))]
        state.check_invariants();
    }

    async fn upload(&self, upload: Option<Upload>) {
        let Some(Upload { checksum, buffer }) = upload else {
            return;
        };
        if let Err(err) = self.remote.write_buffer(&checksum, &buffer).await {
            // the buffer stays resident; eviction asks the remote tier first
            warn!(%checksum, ?err, "failed to write buffer to the write server");
        }
    }

    /// Evicts the buffer if it was not used for its lifetime.
    fn check_expired(&self, checksum: &Checksum) -> Expiry {
        let mut state = self.state.lock();
        let Some(last) = state.last_time.get(checksum).copied() else {
            return Expiry::Gone;
        };
        let length = self
            .infos
            .get_local(checksum)
            .and_then(|info| info.length)
            .unwrap_or(UNKNOWN_LENGTH);
        let lifetime = self.lifetime(length);
        let elapsed = last.elapsed();
        if elapsed < lifetime {
            return Expiry::Rearm((lifetime - elapsed).max(Duration::from_secs(1)));
        }
        if state.refcounts.contains_key(checksum)
            && (self.config.local_mode_full_persistence || state.persistent.contains(checksum))
        {
            return Expiry::AskRemote;
        }
        self.uncache(&mut state, checksum);
        Expiry::Evicted
    }

    fn uncache(&self, state: &mut State, checksum: &Checksum) {
        trace!(%checksum, "evict buffer");
        state.last_time.remove(checksum);
        state.buffers.remove(checksum);
    }

    /// Finishes an eviction that waited for the remote tier.
    fn remote_checked(&self, checksum: &Checksum, remote_has: bool) {
        let mut state = self.state.lock();
        if remote_has {
            self.uncache(&mut state, checksum);
        } else {
            // a later use arms a new timer
            state.last_time.remove(checksum);
        }
    }
}

/// Evicts buffers once their lifetime has passed.
#[derive(derive_more::Debug)]
struct EvictionActor {
    cache: Weak<Inner>,
    msg_rx: mpsc::UnboundedReceiver<Message>,
    #[debug(skip)]
    queue: DelayQueue<Checksum>,
    #[debug(skip)]
    remote_checks: JoinSet<(Checksum, bool)>,
}

impl EvictionActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                maybe_msg = self.msg_rx.recv() => {
                    match maybe_msg {
                        Some(Message::Expire { checksum, delay }) => {
                            self.queue.insert(checksum, delay);
                        }
                        None => break,
                    }
                }
                Some(expired) = self.queue.next() => {
                    let checksum = expired.into_inner();
                    let Some(cache) = self.cache.upgrade() else {
                        break;
                    };
                    match cache.check_expired(&checksum) {
                        Expiry::Rearm(delay) => {
                            self.queue.insert(checksum, delay);
                        }
                        Expiry::AskRemote => {
                            let remote = cache.remote.clone();
                            self.remote_checks.spawn(async move {
                                let has = remote.can_read_buffer(&checksum).await;
                                (checksum, has)
                            });
                        }
                        Expiry::Gone | Expiry::Evicted => {}
                    }
                }
                Some(res) = self.remote_checks.join_next(), if !self.remote_checks.is_empty() => {
                    let Some(cache) = self.cache.upgrade() else {
                        break;
                    };
                    match res {
                        Ok((checksum, has)) => cache.remote_checked(&checksum, has),
                        Err(err) => warn!(?err, "remote check panicked"),
                    }
                }
            }
        }
        debug!("eviction actor stopped");
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::sleep;

    use super::*;
    use crate::{config::RemoteConfig, database::Database};

    fn cache_with(config: BufferConfig, remote: RemoteConfig) -> BufferCache {
        let infos = Arc::new(BufferInfoStore::new(Database::inactive()));
        BufferCache::new(config, RemoteBufferLayer::new(remote), infos)
    }

    fn cache() -> BufferCache {
        cache_with(BufferConfig::default(), RemoteConfig::default())
    }

    #[tokio::test]
    async fn constants_are_always_available() {
        let cache = cache();
        let dict = cache.get(&Checksum::EMPTY_DICT, false).await.unwrap();
        assert_eq!(&*dict, b"{}\n");
        let list = cache.get(&Checksum::EMPTY_LIST, false).await.unwrap();
        assert_eq!(&*list, b"[]\n");
        let guard = cache.incref(&Checksum::EMPTY_LIST, true).await;
        assert_eq!(cache.refcount(&Checksum::EMPTY_LIST), 0);
        drop(guard);
    }

    #[tokio::test]
    async fn refcounts_follow_guards() {
        let cache = cache();
        let buffer = Buffer::from("42\n");
        let checksum = buffer.checksum();
        let a = cache.incref_buffer(&checksum, buffer.clone(), false).await;
        let b = cache.incref(&checksum, false).await;
        assert_eq!(cache.refcount(&checksum), 2);
        assert_eq!(cache.get(&checksum, false).await, Some(buffer));
        drop(a);
        assert_eq!(cache.refcount(&checksum), 1);
        drop(b);
        assert_eq!(cache.refcount(&checksum), 0);
        // unreferenced buffers linger for a while
        assert!(cache.is_resident(&checksum));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn double_decref_warns() {
        let cache = cache();
        cache.decref(&Checksum::new(b"never referenced"));
        assert!(logs_contain("double decref"));
    }

    #[tokio::test]
    async fn missing_resolves_when_buffer_arrives() {
        let cache = cache();
        let buffer = Buffer::from("late\n");
        let checksum = buffer.checksum();
        let _guard = cache.incref(&checksum, true).await;
        assert!(cache.is_missing(&checksum));
        cache.cache(&checksum, buffer.clone()).await;
        assert!(!cache.is_missing(&checksum));
        assert_eq!(cache.get(&checksum, false).await, Some(buffer));
    }

    #[tokio::test(start_paused = true)]
    async fn unreferenced_buffers_expire() {
        let cache = cache_with(
            BufferConfig {
                lifetime_temp: Duration::from_secs(20),
                lifetime_temp_small: Duration::from_secs(600),
                small_buffer_limit: 10,
                ..Default::default()
            },
            RemoteConfig::default(),
        );
        let big = Buffer::from("a buffer above the limit\n");
        let small = Buffer::from("1\n");
        cache.cache(&big.checksum(), big.clone()).await;
        cache.cache(&small.checksum(), small.clone()).await;

        sleep(Duration::from_secs(21)).await;
        assert!(!cache.is_resident(&big.checksum()));
        assert!(cache.is_resident(&small.checksum()));

        sleep(Duration::from_secs(600)).await;
        assert!(!cache.is_resident(&small.checksum()));
    }

    #[tokio::test(start_paused = true)]
    async fn referenced_buffers_stay_without_remote() {
        let cache = cache_with(
            BufferConfig {
                small_buffer_limit: 0,
                ..Default::default()
            },
            RemoteConfig::default(),
        );
        let buffer = Buffer::from("kept\n");
        let checksum = buffer.checksum();
        let guard = cache.incref_buffer(&checksum, buffer, false).await;
        sleep(Duration::from_secs(60)).await;
        assert!(cache.is_resident(&checksum));
        drop(guard);
        sleep(Duration::from_secs(60)).await;
        assert!(!cache.is_resident(&checksum));
    }

    #[tokio::test(start_paused = true)]
    async fn non_persistent_references_can_expire_without_full_persistence() {
        let cache = cache_with(
            BufferConfig {
                small_buffer_limit: 0,
                local_mode_full_persistence: false,
                ..Default::default()
            },
            RemoteConfig::default(),
        );
        let volatile = Buffer::from("volatile\n");
        let kept = Buffer::from("kept\n");
        let _a = cache
            .incref_buffer(&volatile.checksum(), volatile.clone(), false)
            .await;
        let _b = cache.incref_buffer(&kept.checksum(), kept.clone(), true).await;
        sleep(Duration::from_secs(60)).await;
        assert!(!cache.is_resident(&volatile.checksum()));
        assert!(cache.is_resident(&kept.checksum()));
        assert_eq!(cache.persistent_buffers(), vec![kept.checksum()]);
    }

    #[tokio::test]
    async fn buffer_info_length_and_guarantee() -> anyhow::Result<()> {
        let cache = cache();
        let buffer = Buffer::from("[1, 2]\n");
        let checksum = buffer.checksum();
        assert!(cache.get_buffer_info(&checksum, false, false, true).await.is_err());
        cache.cache(&checksum, buffer.clone()).await;
        let info = cache.get_buffer_info(&checksum, false, false, true).await?;
        assert_eq!(info.length, Some(7));
        cache
            .guarantee_buffer_info(&checksum, Celltype::Mixed, None, false)
            .await;
        let info = cache.get_buffer_info(&checksum, false, false, false).await?;
        assert_eq!(info.is_json, Some(true));
        assert_eq!(info.is_numpy, Some(false));
        Ok(())
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn destroy_reports_leaks() {
        let cache = cache();
        let buffer = Buffer::from("leak\n");
        let guard = cache.incref_buffer(&buffer.checksum(), buffer, false).await;
        cache.destroy();
        assert!(logs_contain("1 buffers undestroyed"));
        drop(guard);
    }
}
