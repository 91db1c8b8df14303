// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! One contiguous view over the archive and the live manifest.
//!
//! The spillover archive plus the live ("STM") manifest describe one
//! logical sequence of segments, but only the live manifest is resident.
//! [`AsyncManifestView`] stitches them together: cursors iterate shard by
//! shard, hydrating spilled manifests on demand through the materialized
//! cache, and retention is computed against the stitched sequence without
//! ever materializing it whole.
//!
//! Cursors pin the shard they currently point at. To keep an abandoned
//! cursor from pinning cache entries forever, every cursor carries a TTL:
//! a background sweep drops the pins of cursors idle past
//! `cloud_storage_manifest_cache_ttl_ms` and marks them
//! [`CursorStatus::Evicted`]; an evicted cursor must be recreated.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use shoal_base::retry::RetryChainNode;
use shoal_base::task::AbortOnDropHandle;
use shoal_base::CancellationToken;
use shoal_config::ShoalConfig;
use shoal_model::{Offset, OffsetDelta, SegmentMeta, Timestamp};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::materialized_manifest_cache::{MaterializedManifestCache, PinnedManifest};
use crate::partition_manifest::PartitionManifest;
use crate::remote::Remote;
use crate::remote_path_provider::{RemotePathProvider, SpilloverPathComponents};
use crate::CloudStorageError;

/// How long a single shard hydration (download + decode + cache insert) may
/// take before the cursor operation fails with a timeout.
const HYDRATION_TIMEOUT: Duration = Duration::from_secs(30);
const HYDRATION_BACKOFF: Duration = Duration::from_millis(100);

/// The archive-start movement computed by retention. `{0, 0}` means no
/// constraint was violated and nothing needs to move.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionUpdate {
    pub offset: Offset,
    pub delta: OffsetDelta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStatus {
    /// The cursor holds a position and can be read and advanced.
    Attached,
    /// The TTL expired; the pinned shard was released. Recreate the cursor.
    Evicted,
}

enum Position {
    /// Positioned on a hydrated spillover shard.
    Shard(PinnedManifest),
    /// Positioned on the live manifest.
    Stm,
    /// Past the end of the iterable range.
    Exhausted,
}

struct CursorShared {
    position: Position,
    last_used: Instant,
    status: CursorStatus,
}

impl CursorShared {
    fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

struct ViewInner {
    stm: Arc<RwLock<PartitionManifest>>,
    cache: MaterializedManifestCache,
    remote: Remote,
    path_provider: RemotePathProvider,
    ttl: shoal_config::Binding<Duration>,
    cache_capacity: shoal_config::Binding<u64>,
    cursors: Mutex<Vec<Weak<Mutex<CursorShared>>>>,
    abort: CancellationToken,
}

impl ViewInner {
    fn with_stm<R>(&self, f: impl FnOnce(&PartitionManifest) -> R) -> R {
        let stm = self.stm.read().expect("lock poisoned");
        f(&stm)
    }

    /// Materializes the shard covering `offset`, going to the object store
    /// when the cache misses.
    async fn hydrate(&self, offset: Offset) -> Result<PinnedManifest, CloudStorageError> {
        let (shard_meta, key) = self
            .with_stm(|stm| {
                stm.spillover_containing(offset)
                    .map(|(_, meta)| (*meta, self.shard_key(stm, meta)))
            })
            .ok_or(CloudStorageError::ManifestNotFound(offset))?;

        if let Some(hit) = self.cache.get(shard_meta.base_offset) {
            self.remote.metrics().manifest_cache_hits.inc();
            return Ok(hit);
        }
        self.remote.metrics().manifest_cache_misses.inc();

        debug!(%key, base = %shard_meta.base_offset, "hydrating spillover manifest");
        let mut rtc =
            RetryChainNode::new(HYDRATION_TIMEOUT, HYDRATION_BACKOFF, self.abort.child_token());
        let shard = self
            .remote
            .download_spillover_manifest(&mut rtc, &key, shard_meta.base_offset)
            .await?;
        let size = shoal_base::codec::Codec::encode_to_vec(shard.manifest()).len() as u64;
        let reservation = self.cache.prepare(size, Some(HYDRATION_TIMEOUT)).await?;
        let base = shard
            .manifest()
            .start_offset()
            .expect("spillover manifest can't be empty");
        self.cache.put(reservation, shard);
        self.cache
            .get(base)
            .ok_or(CloudStorageError::ManifestNotFound(offset))
    }

    fn shard_key(&self, stm: &PartitionManifest, meta: &SegmentMeta) -> String {
        self.path_provider
            .spillover_manifest_path(stm, &SpilloverPathComponents::from_meta(meta))
    }

    fn register_cursor(&self, shared: &Arc<Mutex<CursorShared>>) {
        let mut cursors = self.cursors.lock().expect("lock poisoned");
        cursors.retain(|weak| weak.strong_count() > 0);
        cursors.push(Arc::downgrade(shared));
    }

    /// One sweep pass: evict idle cursors and follow the capacity knob.
    fn sweep(&self) {
        let ttl = self.ttl.get();
        let capacity = self.cache_capacity.get();
        if capacity != self.cache.capacity() {
            self.cache.set_capacity(capacity);
        }
        self.remote
            .metrics()
            .manifest_cache_size_bytes
            .set(self.cache.size_bytes() as i64);
        let cursors = self.cursors.lock().expect("lock poisoned");
        for weak in cursors.iter() {
            let Some(shared) = weak.upgrade() else { continue };
            let mut shared = shared.lock().expect("lock poisoned");
            if shared.status == CursorStatus::Attached && shared.last_used.elapsed() >= ttl {
                trace!("evicting idle manifest-view cursor");
                shared.position = Position::Exhausted;
                shared.status = CursorStatus::Evicted;
            }
        }
    }
}

/// See the module docs.
pub struct AsyncManifestView {
    inner: Arc<ViewInner>,
    _sweeper: AbortOnDropHandle<()>,
}

impl AsyncManifestView {
    pub fn new(
        stm: Arc<RwLock<PartitionManifest>>,
        remote: Remote,
        path_provider: RemotePathProvider,
        cfg: &ShoalConfig,
    ) -> Self {
        let cache = MaterializedManifestCache::new(
            cfg.cloud_storage_manifest_cache_size.get(),
            cfg.cloud_storage_manifest_cache_shrink_wakeup_policy.bind(),
        );
        let inner = Arc::new(ViewInner {
            stm,
            cache,
            remote,
            path_provider,
            ttl: cfg.cloud_storage_manifest_cache_ttl.bind(),
            cache_capacity: cfg.cloud_storage_manifest_cache_size.bind(),
            cursors: Mutex::new(Vec::new()),
            abort: CancellationToken::new(),
        });
        let sweeper = {
            let inner = Arc::clone(&inner);
            shoal_base::task::spawn(
                || "cloud_storage::manifest_view_sweep",
                async move {
                    loop {
                        let ttl = inner.ttl.get();
                        let tick = (ttl / 4).max(Duration::from_millis(10));
                        tokio::select! {
                            _ = tokio::time::sleep(tick) => inner.sweep(),
                            _ = inner.abort.cancelled() => return,
                        }
                    }
                },
            )
        };
        AsyncManifestView {
            inner,
            _sweeper: AbortOnDropHandle(sweeper),
        }
    }

    /// Read access to the live manifest.
    pub fn with_stm<R>(&self, f: impl FnOnce(&PartitionManifest) -> R) -> R {
        self.inner.with_stm(f)
    }

    /// The materialized-manifest cache backing this view.
    pub fn cache(&self) -> &MaterializedManifestCache {
        &self.inner.cache
    }

    /// Opens a cursor at `offset`.
    ///
    /// Fails with `OutOfRange` below the archive start (or past the log
    /// end) and with `ManifestNotFound` when no shard covers the offset.
    pub async fn get_active(
        &self,
        offset: Offset,
    ) -> Result<AsyncManifestViewCursor, CloudStorageError> {
        let (archive_start, stm_start, last) = self.inner.with_stm(|stm| {
            (
                stm.archive_start_offset(),
                stm.start_offset(),
                stm.last_offset(),
            )
        });
        let lower = archive_start.or(stm_start);
        if lower.map_or(true, |lo| offset < lo) {
            return Err(CloudStorageError::OutOfRange(offset));
        }
        if last.map_or(true, |hi| offset > hi) {
            return Err(CloudStorageError::OutOfRange(offset));
        }
        let position = match stm_start {
            Some(s) if offset >= s => Position::Stm,
            _ => Position::Shard(self.inner.hydrate(offset).await?),
        };
        Ok(self.cursor(position, None))
    }

    /// Opens a cursor over the retention backlog: the shard range
    /// `[archive_clean_offset, archive_start_offset)` whose data is still
    /// in the object store but no longer addressable.
    pub async fn get_retention_backlog(
        &self,
    ) -> Result<AsyncManifestViewCursor, CloudStorageError> {
        let (clean, start) = self
            .inner
            .with_stm(|stm| (stm.archive_clean_offset(), stm.archive_start_offset()));
        let end = start.unwrap_or(Offset(0));
        let from = clean.unwrap_or(Offset(0));
        let covered = self
            .inner
            .with_stm(|stm| stm.spillover_containing(from).map(|(_, m)| m.base_offset));
        let position = match covered {
            Some(base) if base < end => Position::Shard(self.inner.hydrate(base).await?),
            _ => Position::Exhausted,
        };
        Ok(self.cursor(position, Some(end)))
    }

    /// Computes how far the archive start must advance to satisfy the
    /// retention bounds.
    ///
    /// Three candidates are evaluated against the stitched segment
    /// sequence: keep total size within `max_bytes`, keep the oldest
    /// segment within `max_age`, and honor the start-kafka-offset override.
    /// The furthest candidate wins; `{0, 0}` means no movement.
    pub async fn compute_retention(
        &self,
        max_bytes: Option<u64>,
        max_age: Option<Duration>,
    ) -> Result<RetentionUpdate, CloudStorageError> {
        let mut best = RetentionUpdate::default();
        if let Some(max_bytes) = max_bytes {
            if let Some(upd) = self.size_based_retention(max_bytes).await? {
                best = further(best, upd);
            }
        }
        if let Some(max_age) = max_age {
            if let Some(upd) = self.time_based_retention(max_age).await? {
                best = further(best, upd);
            }
        }
        if let Some(upd) = self.override_based_retention().await? {
            best = further(best, upd);
        }
        Ok(best)
    }

    async fn size_based_retention(
        &self,
        max_bytes: u64,
    ) -> Result<Option<RetentionUpdate>, CloudStorageError> {
        let total = self.inner.with_stm(|stm| stm.cloud_log_size_bytes());
        if total <= max_bytes {
            return Ok(None);
        }
        let mut to_remove = total - max_bytes;
        let mut update = None;
        self.for_each_segment(|meta| {
            update = Some(RetentionUpdate {
                offset: meta.base_offset,
                delta: meta.delta_offset,
            });
            if meta.size_bytes >= to_remove {
                to_remove = 0;
                ControlFlow::Break(())
            } else {
                to_remove -= meta.size_bytes;
                ControlFlow::Continue(())
            }
        })
        .await?;
        Ok(update)
    }

    async fn time_based_retention(
        &self,
        max_age: Duration,
    ) -> Result<Option<RetentionUpdate>, CloudStorageError> {
        let cutoff = Timestamp(
            Timestamp::now().as_millis() - i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX),
        );
        let mut update = None;
        let mut expired_any = false;
        let mut last_expired = None;
        self.for_each_segment(|meta| {
            if meta.base_timestamp < cutoff {
                expired_any = true;
                last_expired = Some(*meta);
                ControlFlow::Continue(())
            } else {
                update = Some(RetentionUpdate {
                    offset: meta.base_offset,
                    delta: meta.delta_offset,
                });
                ControlFlow::Break(())
            }
        })
        .await?;
        if !expired_any {
            return Ok(None);
        }
        // Everything expired: advance past the last segment.
        if update.is_none() {
            update = last_expired.map(|meta| RetentionUpdate {
                offset: meta.committed_offset.next(),
                delta: meta.delta_offset_end,
            });
        }
        Ok(update)
    }

    async fn override_based_retention(
        &self,
    ) -> Result<Option<RetentionUpdate>, CloudStorageError> {
        let Some(k) = self
            .inner
            .with_stm(|stm| stm.start_kafka_offset_override())
        else {
            return Ok(None);
        };
        let mut update = None;
        self.for_each_segment(|meta| {
            if meta.next_kafka_offset() > k {
                update = Some(RetentionUpdate {
                    offset: meta.base_offset,
                    delta: meta.delta_offset,
                });
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await?;
        Ok(update)
    }

    /// Walks every addressable segment in offset order, shard by shard,
    /// until the callback breaks.
    async fn for_each_segment(
        &self,
        mut f: impl FnMut(&SegmentMeta) -> ControlFlow<()>,
    ) -> Result<(), CloudStorageError> {
        let start = self.inner.with_stm(|stm| {
            stm.archive_start_offset()
                .or(stm.start_offset())
                .unwrap_or(Offset(0))
        });
        let mut cursor = match self.get_active(start).await {
            Ok(cursor) => cursor,
            // An empty partition has nothing to walk.
            Err(CloudStorageError::OutOfRange(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        loop {
            let flow = cursor.with_manifest(|m| {
                for meta in m.segments() {
                    if let ControlFlow::Break(()) = f(meta) {
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            })?;
            if flow.is_break() || !cursor.next().await? {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }

    fn cursor(&self, position: Position, end_exclusive: Option<Offset>) -> AsyncManifestViewCursor {
        let shared = Arc::new(Mutex::new(CursorShared {
            position,
            last_used: Instant::now(),
            status: CursorStatus::Attached,
        }));
        self.inner.register_cursor(&shared);
        AsyncManifestViewCursor {
            view: Arc::clone(&self.inner),
            shared,
            end_exclusive,
        }
    }
}

impl std::fmt::Debug for AsyncManifestView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncManifestView").finish_non_exhaustive()
    }
}

/// A cursor over the stitched manifest sequence. Advances one manifest
/// (shard or live) at a time; reads are zero-copy against the pinned shard.
pub struct AsyncManifestViewCursor {
    view: Arc<ViewInner>,
    shared: Arc<Mutex<CursorShared>>,
    /// Exclusive upper bound on shard base offsets; `None` iterates through
    /// the live manifest.
    end_exclusive: Option<Offset>,
}

impl AsyncManifestViewCursor {
    pub fn status(&self) -> CursorStatus {
        self.shared.lock().expect("lock poisoned").status
    }

    /// Runs `f` against the manifest the cursor points at.
    ///
    /// Fails with `Timeout` once the cursor was evicted by the TTL sweep
    /// and with `OutOfRange` when the cursor is past its end.
    pub fn with_manifest<R>(
        &self,
        f: impl FnOnce(&PartitionManifest) -> R,
    ) -> Result<R, CloudStorageError> {
        let mut shared = self.shared.lock().expect("lock poisoned");
        if shared.status == CursorStatus::Evicted {
            return Err(CloudStorageError::Timeout);
        }
        shared.touch();
        match &shared.position {
            Position::Shard(pinned) => Ok(f(pinned.manifest())),
            Position::Stm => Ok(self.view.with_stm(f)),
            Position::Exhausted => Err(CloudStorageError::OutOfRange(Offset(0))),
        }
    }

    /// Advances to the next manifest. Returns `false` at the end of the
    /// iterable range.
    pub async fn next(&mut self) -> Result<bool, CloudStorageError> {
        let next_start = {
            let mut shared = self.shared.lock().expect("lock poisoned");
            if shared.status == CursorStatus::Evicted {
                return Err(CloudStorageError::Timeout);
            }
            shared.touch();
            let next_start = match &shared.position {
                Position::Shard(pinned) => Some(
                    pinned
                        .manifest()
                        .last_offset()
                        .expect("spillover manifest can't be empty")
                        .next(),
                ),
                Position::Stm | Position::Exhausted => None,
            };
            match next_start {
                Some(next_start) => next_start,
                None => {
                    shared.position = Position::Exhausted;
                    return Ok(false);
                }
            }
        };
        if let Some(end) = self.end_exclusive {
            if next_start >= end {
                let mut shared = self.shared.lock().expect("lock poisoned");
                shared.position = Position::Exhausted;
                return Ok(false);
            }
        }
        let stm_start = self.view.with_stm(|stm| stm.start_offset());
        let position = match stm_start {
            Some(s) if next_start >= s && self.end_exclusive.is_none() => Position::Stm,
            _ => Position::Shard(self.view.hydrate(next_start).await?),
        };
        let mut shared = self.shared.lock().expect("lock poisoned");
        shared.touch();
        shared.position = position;
        Ok(true)
    }
}

fn further(a: RetentionUpdate, b: RetentionUpdate) -> RetentionUpdate {
    if b.offset > a.offset {
        b
    } else {
        a
    }
}
