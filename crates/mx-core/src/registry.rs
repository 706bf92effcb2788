//! Registry of media sources behind one muxer. Owns the sources; the
//! active one is tracked by index so switching never invalidates borrows
//! held elsewhere.

use mx_source::file::FILE_DEVICE_PREFIX;
use mx_source::{DeviceInfo, FileSource, MediaKind, MediaSource};
use tracing::{debug, info};

/// Pseudo device name that selects whatever source answers first.
pub const AUTO_DEVICE: &str = "auto";

#[derive(Default)]
pub struct SourceRegistry {
    sources: Vec<Box<dyn MediaSource>>,
    current: Option<usize>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source. Duplicates (same current device) are ignored. The
    /// first registered source becomes the active one.
    pub fn register(&mut self, source: Box<dyn MediaSource>) -> bool {
        let device = source.current_device();
        if self.sources.iter().any(|s| s.current_device() == device) {
            debug!(device, "source already registered");
            return false;
        }
        info!(device, name = source.name(), "registered media source");
        self.sources.push(source);
        if self.current.is_none() {
            self.current = Some(self.sources.len() - 1);
        }
        true
    }

    /// Remove the source serving the given device. Returns it so the
    /// caller can close it outside the registry.
    pub fn unregister(&mut self, device: &str) -> Option<Box<dyn MediaSource>> {
        let idx = self
            .sources
            .iter()
            .position(|s| s.current_device() == device)?;
        let source = self.sources.remove(idx);
        self.current = match self.current {
            // removing the active source falls back to the first remaining
            Some(cur) if cur == idx => (!self.sources.is_empty()).then_some(0),
            Some(cur) if cur > idx => Some(cur - 1),
            other => other,
        };
        Some(source)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current(&mut self) -> Option<&mut dyn MediaSource> {
        let idx = self.current?;
        Some(self.sources[idx].as_mut())
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut dyn MediaSource> {
        match self.sources.get_mut(idx) {
            Some(source) => Some(source.as_mut()),
            None => None,
        }
    }

    pub fn set_current(&mut self, idx: Option<usize>) {
        self.current = idx;
    }

    /// All sources willing to serve the device, in registration order. A
    /// `file:` device nobody claims gets a file source registered for it
    /// on the spot.
    pub fn candidates(&mut self, device: &str, kind: MediaKind) -> Vec<usize> {
        let mut out = Vec::new();
        for (idx, source) in self.sources.iter_mut().enumerate() {
            if source.accepts_device(device, kind) {
                out.push(idx);
            }
        }
        if out.is_empty()
            && let Some(path) = device.strip_prefix(FILE_DEVICE_PREFIX)
        {
            info!(path, "registering file source on demand");
            self.sources.push(Box::new(FileSource::new(path)));
            out.push(self.sources.len() - 1);
        }
        out
    }

    /// First source willing to serve the device.
    pub fn probe(&mut self, device: &str, kind: MediaKind) -> Option<usize> {
        self.candidates(device, kind).into_iter().next()
    }

    /// Hand the filter registrations of one source to another, as done
    /// when the active source changes.
    pub fn transfer_filters(&mut self, from: usize, to: usize) {
        if from == to || from >= self.sources.len() || to >= self.sources.len() {
            return;
        }
        let filters = self.sources[from].take_filters();
        if !filters.is_empty() {
            self.sources[to].add_filters(filters);
        }
    }

    /// Drop every file-backed source that is not currently active.
    pub fn drop_file_sources(&mut self) -> usize {
        let mut removed = 0;
        let mut idx = 0;
        while idx < self.sources.len() {
            let disposable = self.sources[idx].is_file_backed() && self.current != Some(idx);
            if disposable {
                self.sources.remove(idx);
                if let Some(cur) = self.current
                    && cur > idx
                {
                    self.current = Some(cur - 1);
                }
                removed += 1;
            } else {
                idx += 1;
            }
        }
        removed
    }

    /// All devices the registered sources offer, with the auto device
    /// prepended.
    pub fn devices(&self, kind: MediaKind) -> Vec<DeviceInfo> {
        let mut out = vec![DeviceInfo {
            name: AUTO_DEVICE.to_string(),
            description: "first source that answers".to_string(),
            kind,
        }];
        for source in &self.sources {
            out.extend(source.devices(kind));
        }
        out
    }
}
