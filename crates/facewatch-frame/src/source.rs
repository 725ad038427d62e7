//! Frame sources that do not need camera hardware.

use crate::frame::{Frame, FramePool, FrameSink};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no images found in {0}")]
    Empty(PathBuf),
    #[error("failed to spawn source thread: {0}")]
    Spawn(std::io::Error),
}

/// Read a still image file into an encoded frame.
pub fn read_still(path: &Path) -> Result<Frame, SourceError> {
    let data = std::fs::read(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Frame::encoded(data))
}

/// Running source thread. Dropping the handle stops and joins it.
pub struct SourceHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SourceHandle {
    pub(crate) fn new(stop: Arc<AtomicBool>, thread: JoinHandle<()>) -> Self {
        Self { stop, thread: Some(thread) }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the source to stop and wait for its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("frame source thread panicked");
            }
        }
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Replays a directory of still images as a looping frame stream.
///
/// Each file is delivered as an encoded frame at a fixed interval. Like a
/// camera, it never waits for the consumer: when the pool has no free
/// buffer the tick is skipped.
pub struct ImageSequenceSource {
    images: Vec<(PathBuf, Vec<u8>)>,
    interval: Duration,
    pool: Arc<FramePool>,
}

impl ImageSequenceSource {
    /// Load every image file in `dir`, in file-name order.
    pub fn open(dir: &Path, interval: Duration, pool: Arc<FramePool>) -> Result<Self, SourceError> {
        let io_err = |source| SourceError::Io { path: dir.to_path_buf(), source };

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(io_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(SourceError::Empty(dir.to_path_buf()));
        }

        let mut images = Vec::with_capacity(paths.len());
        for path in paths {
            let data = std::fs::read(&path).map_err(|source| SourceError::Io { path: path.clone(), source })?;
            images.push((path, data));
        }

        tracing::info!(dir = %dir.display(), count = images.len(), "image sequence loaded");
        Ok(Self { images, interval, pool })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Start delivering frames to `sink` on a dedicated thread.
    pub fn spawn(self, sink: Arc<dyn FrameSink>) -> Result<SourceHandle, SourceError> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("facewatch-source".into())
            .spawn(move || self.run(sink.as_ref(), &thread_stop))
            .map_err(SourceError::Spawn)?;

        Ok(SourceHandle::new(stop, thread))
    }

    fn run(self, sink: &dyn FrameSink, stop: &AtomicBool) {
        let mut sequence = 0u64;
        let mut skipped = 0u64;

        for (path, data) in self.images.iter().cycle() {
            if stop.load(Ordering::SeqCst) {
                break;
            }

            let mut buf = self.pool.buffer(data.len());
            buf.copy_from_slice(data);
            let frame = Frame::encoded(buf).with_sequence(sequence);
            sequence += 1;

            match self.pool.lease(frame) {
                Some(lease) => sink.deliver(lease),
                None => {
                    skipped += 1;
                    tracing::trace!(path = %path.display(), skipped, "no free frame buffer; skipping tick");
                }
            }

            std::thread::sleep(self.interval);
        }

        tracing::info!(delivered = sequence - skipped, skipped, "image sequence stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameLease, PixelFormat};
    use std::sync::Mutex;

    struct Collect(Mutex<Vec<u64>>);

    impl FrameSink for Collect {
        fn deliver(&self, lease: FrameLease) {
            assert_eq!(lease.format, PixelFormat::Encoded);
            self.0.lock().unwrap().push(lease.sequence);
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("facewatch-source-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_open_empty_dir() {
        let dir = temp_dir("empty");
        std::fs::write(dir.join("notes.txt"), b"not an image").unwrap();
        let err = ImageSequenceSource::open(&dir, Duration::from_millis(1), FramePool::new(2)).err().unwrap();
        assert!(matches!(err, SourceError::Empty(_)));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_open_missing_dir() {
        let err = ImageSequenceSource::open(Path::new("/nonexistent/frames"), Duration::from_millis(1), FramePool::new(2))
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[test]
    fn test_sequence_delivers_and_releases() {
        let dir = temp_dir("deliver");
        std::fs::write(dir.join("b.png"), b"second").unwrap();
        std::fs::write(dir.join("a.jpg"), b"first").unwrap();

        let pool = FramePool::new(2);
        let source = ImageSequenceSource::open(&dir, Duration::from_millis(2), pool.clone()).unwrap();
        assert_eq!(source.len(), 2);

        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let handle = source.spawn(sink.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        handle.stop();

        let seen = sink.0.lock().unwrap().clone();
        assert!(seen.len() >= 2, "delivered {seen:?}");
        assert_eq!(&seen[..2], &[0, 1]);
        assert_eq!(pool.outstanding(), 0);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_read_still_missing() {
        assert!(matches!(read_still(Path::new("/nonexistent.jpg")), Err(SourceError::Io { .. })));
    }
}
