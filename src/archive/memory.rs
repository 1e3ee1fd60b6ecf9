//! In-process archive.

use super::{CollectionFilter, Scene, SceneArchive, SceneMeta};
use crate::grid::{GridChunk, PixelGrid};
use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Archive holding fully materialized scenes covering the whole analysis grid.
#[derive(Default)]
pub struct MemoryArchive {
    scenes: Vec<Scene>,

    /// Number of `load` calls served
    loads: AtomicUsize,

    /// Largest window served, in pixels
    largest_window: AtomicUsize,
}

impl MemoryArchive {
    pub fn new(scenes: Vec<Scene>) -> Self {
        Self {
            scenes,
            loads: AtomicUsize::new(0),
            largest_window: AtomicUsize::new(0),
        }
    }

    /// Number of scene windows loaded so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    /// Pixel count of the largest window loaded so far.
    pub fn largest_window(&self) -> usize {
        self.largest_window.load(Ordering::Relaxed)
    }
}

impl SceneArchive for MemoryArchive {
    async fn query(&self, filter: &CollectionFilter) -> Result<Vec<SceneMeta>> {
        let matches: Vec<SceneMeta> = self
            .scenes
            .iter()
            .filter(|scene| filter.matches(&scene.meta))
            .map(|scene| scene.meta.clone())
            .collect();

        tracing::debug!("Memory archive: {} of {} scenes match", matches.len(), self.scenes.len());

        Ok(matches)
    }

    async fn load(&self, meta: &SceneMeta, grid: &PixelGrid, window: &GridChunk) -> Result<Scene> {
        let scene = self
            .scenes
            .iter()
            .find(|scene| scene.meta.scene_id == meta.scene_id)
            .ok_or_else(|| anyhow::anyhow!("Scene {} is not in the archive", meta.scene_id))?;
        scene.check_consistent(grid)?;
        let part = scene.slice(window)?;

        self.loads.fetch_add(1, Ordering::Relaxed);
        self.largest_window.fetch_max(window.num_pixels(), Ordering::Relaxed);
        Ok(part)
    }
}
