//! Service layer tying the simulation, renderer, and store together.
//!
//! [`GameService`] is what a chat-bot front end talks to: it owns the live
//! games, drives catch-up ticks, and persists through the [`GameStore`]
//! seam. Mutations follow a draft-and-commit discipline: the live game is
//! cloned, the draft is advanced and saved, and only a successful save
//! promotes the draft to live state. A failed save therefore leaves the
//! in-memory game exactly where the last successful save left it.

use chatsnake_core::{
    Cell, Direction, Game, GameConfig, GameError, GameStore, GroupId, PlayerId,
    SimulationEngine, StoreError,
};
use chatsnake_render::{Compositor, RenderError};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("no game for group {0}")]
    GameNotFound(GroupId),
    #[error(transparent)]
    Game(#[from] GameError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Top-level application configuration, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Path of the DuckDB database file.
    pub db_path: PathBuf,
    /// Directory of pre-rendered sprite files loaded at startup.
    pub sprite_dir: PathBuf,
    /// Directory board images are written to.
    pub output_dir: PathBuf,
    /// Edge length of one board cell in pixels.
    pub cell_size: u32,
    /// Defaults applied when a group's game is first created.
    pub game: GameConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("chatsnake.duckdb"),
            sprite_dir: PathBuf::from("sprites"),
            output_dir: PathBuf::from("output"),
            cell_size: 32,
            game: GameConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl AppConfig {
    /// Read the config at `path`, writing out the defaults first when the
    /// file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&raw)?)
        } else {
            let defaults = Self::default();
            std::fs::write(path, serde_json::to_string_pretty(&defaults)?)?;
            info!(config = %path.display(), "wrote default configuration");
            Ok(defaults)
        }
    }
}

/// One bot-facing request to advance and view a group's board.
#[derive(Debug, Clone)]
pub struct BoardRequest {
    pub group: GroupId,
    pub player: PlayerId,
    /// Unix seconds of the request.
    pub now: i64,
}

/// Owns live games and mediates every mutation through draft-and-commit.
pub struct GameService<S> {
    store: S,
    engine: SimulationEngine,
    compositor: Compositor,
    defaults: GameConfig,
    games: HashMap<GroupId, Game>,
}

impl<S: GameStore> GameService<S> {
    #[must_use]
    pub fn new(store: S, compositor: Compositor, defaults: GameConfig) -> Self {
        let engine = SimulationEngine::new(defaults.rng_seed);
        Self {
            store,
            engine,
            compositor,
            defaults,
            games: HashMap::new(),
        }
    }

    /// Live view of a group's game, if one is loaded.
    #[must_use]
    pub fn game(&self, group: &GroupId) -> Option<&Game> {
        self.games.get(group)
    }

    /// Advance the group's game up to `request.now` (creating it, and the
    /// player's snake, as needed), persist, and composite the board for the
    /// requesting player.
    pub fn advance_and_render(&mut self, request: &BoardRequest) -> Result<RgbaImage, ServiceError> {
        validate_id("group", request.group.as_str())?;
        validate_id("player", request.player.as_str())?;

        let mut draft = self.checkout(&request.group, request.now)?;
        let eaten = self
            .engine
            .advance_if_due(&mut draft, request.now, &request.player);
        if !eaten.is_empty() {
            info!(group = %request.group, eaten = eaten.len(), "food consumed this batch");
        }
        self.commit(draft)?;

        let game = self
            .games
            .get(&request.group)
            .ok_or_else(|| ServiceError::GameNotFound(request.group.clone()))?;
        Ok(self.compositor.render(game, &request.player)?)
    }

    /// Point the player's snake in a new direction and persist the change.
    /// The heading applies from the next tick batch onward.
    pub fn set_direction(
        &mut self,
        group: &GroupId,
        player: &PlayerId,
        direction: &str,
    ) -> Result<(), ServiceError> {
        validate_id("group", group.as_str())?;
        validate_id("player", player.as_str())?;
        let direction: Direction = direction.parse()?;

        let mut draft = self
            .load_existing(group)?
            .ok_or_else(|| ServiceError::GameNotFound(group.clone()))?;
        draft.map.set_direction(player, direction)?;
        self.commit(draft)
    }

    /// Drop a named food item onto a free cell of the group's board.
    /// `Ok(None)` when the board had no free cell to offer.
    pub fn add_food(
        &mut self,
        group: &GroupId,
        name: &str,
    ) -> Result<Option<Cell>, ServiceError> {
        validate_id("group", group.as_str())?;
        validate_id("food name", name)?;

        let mut draft = self
            .load_existing(group)?
            .ok_or_else(|| ServiceError::GameNotFound(group.clone()))?;
        let placed = self.engine.add_food(&mut draft.map, name);
        if placed.is_none() {
            warn!(group = %group, name, "no free cell for food");
            return Ok(None);
        }
        self.commit(draft)?;
        Ok(placed)
    }

    /// Clone the group's game for mutation, pulling it from the store or
    /// creating it fresh when this process has never seen it.
    fn checkout(&mut self, group: &GroupId, now: i64) -> Result<Game, ServiceError> {
        if let Some(game) = self.games.get(group) {
            return Ok(game.clone());
        }
        if let Some(game) = self.store.load_game(group)? {
            return Ok(game);
        }
        info!(group = %group, "creating new game");
        Ok(self.engine.create_game(group.clone(), &self.defaults, now)?)
    }

    fn load_existing(&mut self, group: &GroupId) -> Result<Option<Game>, ServiceError> {
        if let Some(game) = self.games.get(group) {
            return Ok(Some(game.clone()));
        }
        Ok(self.store.load_game(group)?)
    }

    /// Save the draft; only a successful save replaces the live game.
    fn commit(&mut self, draft: Game) -> Result<(), ServiceError> {
        self.store.save_game(&draft)?;
        self.games.insert(draft.group.clone(), draft);
        Ok(())
    }
}

fn validate_id(what: &str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        return Err(ServiceError::Validation(format!("{what} must not be empty")));
    }
    Ok(())
}
