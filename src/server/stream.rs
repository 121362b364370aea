//! Single-writer/multi-reader chunked pipes.
//!
//! A stream is a FIFO of blob chunks. The writer either asks the store to
//! allocate the next chunk (`get`) or pushes blobs it created itself
//! (`push`); readers block in `pull` until a chunk is ready. Chunks are
//! ordinary bulk-store payloads; consumers fetch their bytes through the
//! regular buffer path.
//!
//! Stopping a stream drains it: pending chunks can still be pulled, after
//! which readers see `StreamDrained` (or `StreamFailed` if the writer
//! aborted). Dropping a stream wakes every blocked reader with an error.

use super::bulk::BulkStore;
use crate::error::{Error, Result};
use crate::memory::ObjectID;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Open the stream for reading.
pub const OPEN_MODE_READ: i64 = 1;
/// Open the stream for writing.
pub const OPEN_MODE_WRITE: i64 = 2;

#[derive(Default)]
struct Stream {
    chunks: VecDeque<ObjectID>,
    /// Chunk currently being filled by the writer; queued on the next
    /// `get` or at stop.
    current: Option<ObjectID>,
    reader_open: bool,
    writer_open: bool,
    stopped: bool,
    failed: bool,
    dropped: bool,
}

struct StreamInner {
    streams: HashMap<ObjectID, Stream>,
    /// Bytes held by unconsumed chunks across all streams.
    used_bytes: usize,
}

/// The store of open streams of one session.
pub struct StreamStore {
    bulk: Arc<BulkStore>,
    inner: Mutex<StreamInner>,
    ready: Condvar,
    /// Ceiling for unconsumed chunk bytes.
    threshold_bytes: usize,
}

impl StreamStore {
    /// `threshold` is the percentage of the bulk-store ceiling that
    /// streams may hold in unconsumed chunks.
    pub fn new(bulk: Arc<BulkStore>, threshold: u8) -> StreamStore {
        let threshold_bytes = bulk.footprint_limit() / 100 * threshold as usize;
        StreamStore {
            bulk,
            inner: Mutex::new(StreamInner {
                streams: HashMap::new(),
                used_bytes: 0,
            }),
            ready: Condvar::new(),
            threshold_bytes,
        }
    }

    /// Register a stream id.
    pub fn create(&self, stream_id: ObjectID) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.streams.contains_key(&stream_id) {
            return Err(Error::StreamOpened);
        }
        inner.streams.insert(stream_id, Stream::default());
        debug!(stream = %stream_id, "created stream");
        Ok(())
    }

    /// Open the stream in read or write mode; each side is exclusive.
    pub fn open(&self, stream_id: ObjectID, mode: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let stream = Self::lookup(&mut inner, stream_id)?;
        match mode {
            OPEN_MODE_READ => {
                if stream.reader_open {
                    return Err(Error::StreamOpened);
                }
                stream.reader_open = true;
            }
            OPEN_MODE_WRITE => {
                if stream.writer_open {
                    return Err(Error::StreamOpened);
                }
                stream.writer_open = true;
            }
            other => {
                return Err(Error::Invalid(format!("unknown stream open mode: {other}")));
            }
        }
        Ok(())
    }

    /// Allocate the next chunk for the writer. The previous chunk, if
    /// any, becomes ready for readers.
    pub fn get(&self, stream_id: ObjectID, size: usize) -> Result<ObjectID> {
        let mut inner = self.inner.lock();
        {
            let stream = Self::lookup(&mut inner, stream_id)?;
            if stream.stopped {
                return Err(Error::StreamDrained);
            }
        }
        if inner.used_bytes + size > self.threshold_bytes {
            return Err(Error::NotEnoughMemory(format!(
                "streams hold {} bytes, the threshold is {}",
                inner.used_bytes, self.threshold_bytes
            )));
        }
        let (chunk, _payload) = self.bulk.create(size)?;
        self.bulk.seal(chunk)?;

        let stream = Self::lookup(&mut inner, stream_id)?;
        let previous = stream.current.replace(chunk);
        if let Some(previous) = previous {
            stream.chunks.push_back(previous);
            self.ready.notify_all();
        }
        inner.used_bytes += size;
        Ok(chunk)
    }

    /// Queue a chunk the writer created through the ordinary buffer path.
    pub fn push(&self, stream_id: ObjectID, chunk: ObjectID) -> Result<()> {
        let size = self
            .bulk
            .get(&[chunk], true)?
            .first()
            .map(|payload| payload.data_size)
            .unwrap_or(0);
        let mut inner = self.inner.lock();
        let stream = Self::lookup(&mut inner, stream_id)?;
        if stream.stopped {
            return Err(Error::StreamDrained);
        }
        stream.chunks.push_back(chunk);
        inner.used_bytes += size;
        self.ready.notify_all();
        Ok(())
    }

    /// Block until the next chunk is ready and dequeue it.
    ///
    /// A stopped stream drains its queue first, then yields
    /// [`Error::StreamDrained`] (or [`Error::StreamFailed`] after an
    /// aborted writer or a dropped stream).
    pub fn pull(&self, stream_id: ObjectID) -> Result<ObjectID> {
        let mut inner = self.inner.lock();
        loop {
            let (chunk, failed, stopped) = {
                let stream = Self::lookup(&mut inner, stream_id)?;
                (
                    stream.chunks.pop_front(),
                    stream.failed || stream.dropped,
                    stream.stopped,
                )
            };
            if let Some(chunk) = chunk {
                let size = self
                    .bulk
                    .get(&[chunk], true)
                    .ok()
                    .and_then(|payloads| payloads.first().map(|p| p.data_size))
                    .unwrap_or(0);
                inner.used_bytes = inner.used_bytes.saturating_sub(size);
                return Ok(chunk);
            }
            if failed {
                return Err(Error::StreamFailed);
            }
            if stopped {
                return Err(Error::StreamDrained);
            }
            self.ready.wait(&mut inner);
        }
    }

    /// Finish the stream. The chunk being filled, if any, becomes ready.
    pub fn stop(&self, stream_id: ObjectID, failed: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let stream = Self::lookup(&mut inner, stream_id)?;
        if let Some(current) = stream.current.take() {
            stream.chunks.push_back(current);
        }
        stream.stopped = true;
        stream.failed = failed;
        self.ready.notify_all();
        Ok(())
    }

    /// Tear the stream down, waking blocked readers with an error. Called
    /// when a subscribed connection goes away.
    pub fn drop_stream(&self, stream_id: ObjectID) {
        let mut inner = self.inner.lock();
        if let Some(stream) = inner.streams.get_mut(&stream_id) {
            stream.dropped = true;
            stream.stopped = true;
            self.ready.notify_all();
            debug!(stream = %stream_id, "dropped stream");
        }
    }

    fn lookup(inner: &mut StreamInner, stream_id: ObjectID) -> Result<&mut Stream> {
        inner
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| Error::ObjectNotExists(format!("stream not exists: {stream_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AllocatorKind;
    use std::time::Duration;

    fn make_store() -> StreamStore {
        let bulk = Arc::new(BulkStore::new(
            AllocatorKind::Dlmalloc,
            1 << 20,
            None,
            0.3,
            0.8,
        ));
        StreamStore::new(bulk, 80)
    }

    fn stream_id() -> ObjectID {
        ObjectID(0x17)
    }

    #[test]
    fn test_create_twice_fails() {
        let store = make_store();
        store.create(stream_id()).unwrap();
        assert!(matches!(store.create(stream_id()), Err(Error::StreamOpened)));
    }

    #[test]
    fn test_open_modes_are_exclusive() {
        let store = make_store();
        store.create(stream_id()).unwrap();
        store.open(stream_id(), OPEN_MODE_READ).unwrap();
        assert!(store.open(stream_id(), OPEN_MODE_READ).is_err());
        store.open(stream_id(), OPEN_MODE_WRITE).unwrap();
        assert!(store.open(stream_id(), OPEN_MODE_WRITE).is_err());
    }

    #[test]
    fn test_get_queues_previous_chunk() {
        let store = make_store();
        store.create(stream_id()).unwrap();

        let first = store.get(stream_id(), 256).unwrap();
        // nothing ready yet: the first chunk is still being filled
        let second = store.get(stream_id(), 256).unwrap();
        assert_ne!(first, second);

        let pulled = store.pull(stream_id()).unwrap();
        assert_eq!(pulled, first);

        store.stop(stream_id(), false).unwrap();
        assert_eq!(store.pull(stream_id()).unwrap(), second);
        assert!(store.pull(stream_id()).unwrap_err().is_stream_drained());
    }

    #[test]
    fn test_push_then_pull_across_threads() {
        let store = Arc::new(make_store());
        store.create(stream_id()).unwrap();
        let (chunk, _) = store.bulk.create(64).unwrap();
        store.bulk.seal(chunk).unwrap();

        let reader = {
            let store = store.clone();
            std::thread::spawn(move || store.pull(stream_id()))
        };
        std::thread::sleep(Duration::from_millis(50));
        store.push(stream_id(), chunk).unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), chunk);
    }

    #[test]
    fn test_drop_wakes_blocked_reader_with_error() {
        let store = Arc::new(make_store());
        store.create(stream_id()).unwrap();

        let reader = {
            let store = store.clone();
            std::thread::spawn(move || store.pull(stream_id()))
        };
        std::thread::sleep(Duration::from_millis(50));
        store.drop_stream(stream_id());
        assert!(matches!(
            reader.join().unwrap(),
            Err(Error::StreamFailed)
        ));
    }

    #[test]
    fn test_stop_failed_propagates() {
        let store = make_store();
        store.create(stream_id()).unwrap();
        store.stop(stream_id(), true).unwrap();
        assert!(matches!(store.pull(stream_id()), Err(Error::StreamFailed)));
    }

    #[test]
    fn test_threshold_bounds_unconsumed_bytes() {
        let bulk = Arc::new(BulkStore::new(
            AllocatorKind::Dlmalloc,
            1 << 20,
            None,
            0.3,
            0.8,
        ));
        // 1% of 1 MiB leaves room for a single small chunk only
        let store = StreamStore::new(bulk, 1);
        store.create(stream_id()).unwrap();
        store.get(stream_id(), 8 << 10).unwrap();
        let err = store.get(stream_id(), 8 << 10).unwrap_err();
        assert!(matches!(err, Error::NotEnoughMemory(_)));
    }
}
