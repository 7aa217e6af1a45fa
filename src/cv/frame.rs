//! Latest-frame slot shared between the grabber thread and async readers.
//!
//! Exactly one slot: an update replaces the previous frame atomically under
//! the mutex; readers get copies and never observe a partial write. The lock
//! is held only for the swap/clone, never across I/O.

use std::sync::Mutex;

use serde::Serialize;

/// Minimap-region annotation carried with a frame when detection ran on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RegionInfo {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub confidence: f64,
    pub white_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameMeta {
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
    pub size_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<RegionInfo>,
}

#[derive(Default)]
pub struct FrameSlot {
    inner: Mutex<Option<(Vec<u8>, FrameMeta)>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        FrameSlot::default()
    }

    /// Publish a new JPEG frame, replacing whatever was there.
    pub fn update(&self, jpeg: Vec<u8>, mut meta: FrameMeta) {
        meta.size_bytes = jpeg.len();
        let mut slot = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some((jpeg, meta));
    }

    /// Copy of the latest frame, if any.
    pub fn latest(&self) -> Option<(Vec<u8>, FrameMeta)> {
        let slot = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        slot.clone()
    }

    pub fn has_frame(&self) -> bool {
        let slot = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        slot.is_some()
    }

    pub fn clear(&self) {
        let mut slot = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(ts: f64) -> FrameMeta {
        FrameMeta {
            timestamp: ts,
            width: 4,
            height: 4,
            size_bytes: 0,
            region: None,
        }
    }

    #[test]
    fn update_replaces_and_readers_copy() {
        let slot = FrameSlot::new();
        assert!(!slot.has_frame());
        slot.update(vec![1, 2, 3], meta(1.0));
        slot.update(vec![4, 5], meta(2.0));

        let (bytes, m) = slot.latest().unwrap();
        assert_eq!(bytes, vec![4, 5]);
        assert_eq!(m.timestamp, 2.0);
        assert_eq!(m.size_bytes, 2);

        // The copy is independent of further updates.
        slot.update(vec![9], meta(3.0));
        assert_eq!(bytes, vec![4, 5]);
    }

    #[test]
    fn clear_empties_the_slot() {
        let slot = FrameSlot::new();
        slot.update(vec![1], meta(1.0));
        slot.clear();
        assert!(slot.latest().is_none());
    }

    #[test]
    fn shared_across_threads() {
        use std::sync::Arc;
        let slot = Arc::new(FrameSlot::new());
        let writer = Arc::clone(&slot);
        let handle = std::thread::spawn(move || {
            for i in 0..100u8 {
                writer.update(vec![i], meta(i as f64));
            }
        });
        for _ in 0..100 {
            if let Some((bytes, m)) = slot.latest() {
                assert_eq!(bytes.len(), 1);
                assert_eq!(bytes[0] as f64, m.timestamp);
            }
        }
        handle.join().unwrap();
    }
}
