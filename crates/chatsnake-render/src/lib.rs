//! Board compositing.
//!
//! A render turns one [`Game`] into a full RGBA board image for one viewer.
//! The expensive part, the viewer-specific blurred background with grid
//! lines, is built once per `(group, viewer, cell_size)` and cached
//! process-wide; per-render work is entity compositing only. Each snake and
//! each food cell is drawn onto its own transparent layer by a rayon worker;
//! once every layer is done they are merged onto the canvas one at a time.
//! A cell whose sprite is not in the table renders as a solid block, so a
//! missing sprite can never fail a render.

use chatsnake_core::{Cell, Game, GroupId, PlayerId, SpriteKey};
use chatsnake_sprites::SpriteTable;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgba, RgbaImage};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render canvas lock poisoned")]
    Poisoned,
}

/// Tunables for one compositor instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    /// Edge length of one board cell in pixels.
    pub cell_size: u32,
    /// Grid line colour drawn over the background.
    pub grid_color: Rgba<u8>,
    /// Background fill when the viewer has no blurred avatar.
    pub background_color: Rgba<u8>,
    /// Block colour for cells whose sprite cannot be resolved at all.
    pub fallback_color: Rgba<u8>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            cell_size: 32,
            grid_color: Rgba([230, 230, 230, 255]),
            background_color: Rgba([255, 255, 255, 255]),
            fallback_color: Rgba([20, 20, 20, 255]),
        }
    }
}

/// Cache key for one prepared background layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayerKey {
    pub group: GroupId,
    pub viewer: PlayerId,
    pub cell_size: u32,
}

/// Process-wide store of prepared background layers.
///
/// Shared between compositors via `Arc`; entries are immutable once built,
/// so hits are a map lookup plus an `Arc` clone.
#[derive(Debug, Default)]
pub struct LayerCache {
    layers: Mutex<HashMap<LayerKey, Arc<RgbaImage>>>,
}

impl LayerCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the layer for `key`, building and storing it on first use.
    /// Builds are serialized under the cache lock.
    pub fn get_or_build(
        &self,
        key: &LayerKey,
        build: impl FnOnce() -> RgbaImage,
    ) -> Result<Arc<RgbaImage>, RenderError> {
        let mut layers = self.layers.lock().map_err(|_| RenderError::Poisoned)?;
        if let Some(layer) = layers.get(key) {
            trace!(group = %key.group, viewer = %key.viewer, "background cache hit");
            return Ok(Arc::clone(layer));
        }
        let layer = Arc::new(build());
        layers.insert(key.clone(), Arc::clone(&layer));
        debug!(group = %key.group, viewer = %key.viewer, key.cell_size, "built background layer");
        Ok(layer)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.lock().map(|layers| layers.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns game state into board images against a shared sprite table and
/// background cache.
pub struct Compositor {
    sprites: Arc<SpriteTable>,
    cache: Arc<LayerCache>,
    config: RenderConfig,
}

impl Compositor {
    #[must_use]
    pub fn new(sprites: Arc<SpriteTable>, cache: Arc<LayerCache>, config: RenderConfig) -> Self {
        Self {
            sprites,
            cache,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Composite the full board as seen by `viewer`.
    pub fn render(&self, game: &Game, viewer: &PlayerId) -> Result<RgbaImage, RenderError> {
        let cell = self.config.cell_size;
        let canvas_w = game.map.width() * cell;
        let canvas_h = game.map.height() * cell;

        let key = LayerKey {
            group: game.group.clone(),
            viewer: viewer.clone(),
            cell_size: cell,
        };
        let background = self
            .cache
            .get_or_build(&key, || self.build_background(viewer, canvas_w, canvas_h))?;

        // One layer job per snake, one per food cell.
        let mut jobs: Vec<Vec<Cell>> = game
            .map
            .snakes()
            .map(|snake| snake.cells.clone())
            .collect();
        jobs.extend(game.map.food().iter().map(|food| vec![food.clone()]));

        // All layers finish drawing before the first merge; the collect is
        // the join point.
        let layers: Vec<RgbaImage> = jobs
            .par_iter()
            .map(|cells| self.draw_layer(cells, canvas_w, canvas_h))
            .collect();

        let mut canvas = RgbaImage::clone(&background);
        for layer in &layers {
            imageops::overlay(&mut canvas, layer, 0, 0);
        }
        Ok(canvas)
    }

    /// Transparent full-canvas layer with one sprite (or fallback block)
    /// per cell. Runs lock-free on a rayon worker.
    fn draw_layer(&self, cells: &[Cell], canvas_w: u32, canvas_h: u32) -> RgbaImage {
        let cell_size = self.config.cell_size;
        let mut layer = RgbaImage::new(canvas_w, canvas_h);
        for cell in cells {
            let px = i64::from(cell.x) * i64::from(cell_size);
            let py = i64::from(cell.y) * i64::from(cell_size);
            match self.resolve(&cell.sprite) {
                Some(sprite) => {
                    if sprite.dimensions() == (cell_size, cell_size) {
                        imageops::overlay(&mut layer, &*sprite, px, py);
                    } else {
                        let scaled =
                            imageops::resize(&*sprite, cell_size, cell_size, FilterType::Triangle);
                        imageops::overlay(&mut layer, &scaled, px, py);
                    }
                }
                None => fill_rect(
                    &mut layer,
                    px as u32,
                    py as u32,
                    cell_size,
                    cell_size,
                    self.config.fallback_color,
                ),
            }
        }
        layer
    }

    /// Sprite lookup; the table holds avatar and food entries alike, keyed
    /// by the exact name a cell carries. `None` means the caller draws a
    /// solid block.
    fn resolve(&self, key: &SpriteKey) -> Option<Arc<RgbaImage>> {
        self.sprites.get(key)
    }

    /// Viewer background: the blurred avatar cover-scaled to the canvas when
    /// available, a plain fill otherwise, with grid lines on top.
    fn build_background(&self, viewer: &PlayerId, canvas_w: u32, canvas_h: u32) -> RgbaImage {
        let mut background = match self.sprites.get(&SpriteKey::avatar_blurred(viewer)) {
            Some(avatar) => DynamicImage::ImageRgba8(RgbaImage::clone(&avatar))
                .resize_to_fill(canvas_w, canvas_h, FilterType::Triangle)
                .to_rgba8(),
            None => RgbaImage::from_pixel(canvas_w, canvas_h, self.config.background_color),
        };
        self.draw_grid(&mut background, canvas_w, canvas_h);
        background
    }

    fn draw_grid(&self, image: &mut RgbaImage, canvas_w: u32, canvas_h: u32) {
        let cell = self.config.cell_size;
        let color = self.config.grid_color;
        for gx in (0..canvas_w).step_by(cell as usize) {
            for y in 0..canvas_h {
                image.put_pixel(gx, y, color);
            }
        }
        for gy in (0..canvas_h).step_by(cell as usize) {
            for x in 0..canvas_w {
                image.put_pixel(x, gy, color);
            }
        }
    }
}

fn fill_rect(image: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32, color: Rgba<u8>) {
    let (max_x, max_y) = image.dimensions();
    for py in y..(y + h).min(max_y) {
        for px in x..(x + w).min(max_x) {
            image.put_pixel(px, py, color);
        }
    }
}
