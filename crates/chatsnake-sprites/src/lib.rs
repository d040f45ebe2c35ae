//! Sprite ingestion and lookup.
//!
//! The simulation references sprites by [`SpriteKey`] only; this crate owns
//! the actual pixels. Avatars arrive once per player and are expanded into
//! the four variants the renderer expects (full, blurred, cell-sized, and
//! absorbed). Food images get a cell-sized and a blurred cell-sized variant.
//! All variants live in one shared [`SpriteTable`] behind a read-write lock,
//! handed out as `Arc` clones so render workers never copy pixel data.

use chatsnake_core::{PlayerId, SpriteKey};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbaImage};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

/// Gaussian sigma applied to full-size background variants.
const BACKGROUND_BLUR_SIGMA: f32 = 8.0;
/// Gaussian sigma applied to cell-sized absorbed variants.
const CELL_BLUR_SIGMA: f32 = 2.0;

#[derive(Debug, Error)]
pub enum SpriteError {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sprite table lock poisoned")]
    Poisoned,
}

/// Shared key-to-pixels table.
///
/// Writes happen at ingest time (player joins, startup directory load);
/// reads happen on every render, concurrently from rayon workers.
#[derive(Debug, Default)]
pub struct SpriteTable {
    entries: RwLock<HashMap<String, Arc<RgbaImage>>>,
}

impl SpriteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `image` under `key`, replacing any previous entry.
    pub fn insert(&self, key: SpriteKey, image: RgbaImage) -> Result<(), SpriteError> {
        let mut entries = self.entries.write().map_err(|_| SpriteError::Poisoned)?;
        entries.insert(key.as_str().to_string(), Arc::new(image));
        Ok(())
    }

    /// Cheap `Arc` handle to the pixels behind `key`, if registered.
    #[must_use]
    pub fn get(&self, key: &SpriteKey) -> Option<Arc<RgbaImage>> {
        let entries = self.entries.read().ok()?;
        entries.get(key.as_str()).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &SpriteKey) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(key.as_str()))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expand a player's avatar into its four render variants.
    ///
    /// Registered under the keys the simulation will emit: `{id}.jpg` and
    /// `{id}_blur.jpg` at full size, `{id}_small.jpg` and `{id}_blur_small.jpg`
    /// at `cell_edge` pixels square.
    pub fn ingest_avatar(
        &self,
        player: &PlayerId,
        source: &DynamicImage,
        cell_edge: u32,
    ) -> Result<(), SpriteError> {
        let full = source.to_rgba8();
        let blurred = imageops::blur(&full, BACKGROUND_BLUR_SIGMA);
        let small = imageops::resize(&full, cell_edge, cell_edge, FilterType::Triangle);
        let blurred_small = imageops::blur(&small, CELL_BLUR_SIGMA);

        self.insert(SpriteKey::avatar_full(player), full)?;
        self.insert(SpriteKey::avatar_blurred(player), blurred)?;
        self.insert(SpriteKey::avatar_small(player), small)?;
        self.insert(SpriteKey::avatar_absorbed(player), blurred_small)?;
        debug!(player = %player, cell_edge, "ingested avatar variants");
        Ok(())
    }

    /// Expand a food image into its cell-sized and absorbed variants,
    /// `{name}_small.png` and `{name}_blur.png`.
    pub fn ingest_food(
        &self,
        name: &str,
        source: &DynamicImage,
        cell_edge: u32,
    ) -> Result<(), SpriteError> {
        let small = imageops::resize(
            &source.to_rgba8(),
            cell_edge,
            cell_edge,
            FilterType::Triangle,
        );
        let blurred = imageops::blur(&small, CELL_BLUR_SIGMA);
        self.insert(SpriteKey::food_small(name), small)?;
        self.insert(SpriteKey::food_small(name).to_absorbed(), blurred)?;
        debug!(name, cell_edge, "ingested food variants");
        Ok(())
    }

    /// Load every decodable image in `dir`, keyed by file name. Unreadable
    /// files are logged and skipped so one bad file cannot block startup.
    pub fn load_directory(&self, dir: &Path) -> Result<usize, SpriteError> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match image::open(&path) {
                Ok(decoded) => {
                    self.insert(SpriteKey::new(name), decoded.to_rgba8())?;
                    loaded += 1;
                }
                Err(err) => {
                    warn!(file = %path.display(), %err, "skipping undecodable sprite");
                }
            }
        }
        debug!(dir = %dir.display(), loaded, "loaded sprite directory");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba(rgba)))
    }

    #[test]
    fn avatar_ingest_registers_all_four_variants() {
        let table = SpriteTable::new();
        let player = PlayerId::new("alice");
        table
            .ingest_avatar(&player, &solid(128, 128, [200, 30, 30, 255]), 32)
            .expect("ingest");

        assert_eq!(table.len(), 4);
        let full = table.get(&SpriteKey::avatar_full(&player)).expect("full");
        assert_eq!(full.dimensions(), (128, 128));
        let small = table.get(&SpriteKey::avatar_small(&player)).expect("small");
        assert_eq!(small.dimensions(), (32, 32));
        let absorbed = table
            .get(&SpriteKey::avatar_absorbed(&player))
            .expect("absorbed");
        assert_eq!(absorbed.dimensions(), (32, 32));
        assert!(table.contains(&SpriteKey::avatar_blurred(&player)));
    }

    #[test]
    fn food_ingest_matches_the_absorbed_relabel() {
        let table = SpriteTable::new();
        table
            .ingest_food("apple", &solid(64, 64, [30, 200, 30, 255]), 16)
            .expect("ingest");

        let small_key = SpriteKey::food_small("apple");
        assert!(table.contains(&small_key));
        // The relabeled key a snake carries after eating resolves directly.
        assert!(table.contains(&small_key.to_absorbed()));
        assert_eq!(small_key.to_absorbed().as_str(), "apple_blur.png");
    }

    #[test]
    fn get_returns_shared_handles_not_copies() {
        let table = SpriteTable::new();
        table
            .insert(SpriteKey::new("x"), RgbaImage::new(4, 4))
            .expect("insert");
        let a = table.get(&SpriteKey::new("x")).expect("a");
        let b = table.get(&SpriteKey::new("x")).expect("b");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(table.get(&SpriteKey::new("missing")).is_none());
    }

    #[test]
    fn insert_replaces_previous_entry() {
        let table = SpriteTable::new();
        table
            .insert(SpriteKey::new("x"), RgbaImage::new(4, 4))
            .expect("first");
        table
            .insert(SpriteKey::new("x"), RgbaImage::new(8, 8))
            .expect("second");
        assert_eq!(table.len(), 1);
        let current = table.get(&SpriteKey::new("x")).expect("entry");
        assert_eq!(current.dimensions(), (8, 8));
    }
}
