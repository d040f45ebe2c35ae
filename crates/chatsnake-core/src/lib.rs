//! Core types and simulation rules shared across the chatsnake workspace.
//!
//! A [`Game`] is one chat group's persistent snake match on a toroidal grid.
//! Snakes belong to player identities, advance on wall-clock catch-up ticks,
//! and interact through self-collision, head-to-body eating, and food
//! consumption. Rendering and persistence live in sibling crates; this crate
//! only references sprites by opaque key and exposes the [`GameStore`] seam
//! for backends.

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Attempts made to find an unoccupied spawn cell before settling for the
/// last sample.
const SPAWN_SAMPLE_ATTEMPTS: u32 = 64;
/// Attempts made to place a food cell before giving up entirely.
const FOOD_SAMPLE_ATTEMPTS: u32 = 128;

/// Chat group identity owning one game.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Player identity; snakes are keyed by it and its ordering is the stable
/// tie-break order used throughout collision resolution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque sprite reference resolved against external image tables.
///
/// Keys follow the ingest pipeline's file naming: avatars produce
/// `{id}.jpg`, `{id}_blur.jpg`, `{id}_small.jpg`, and `{id}_blur_small.jpg`;
/// food produces `{name}_small.png` and `{name}_blur.png`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpriteKey(String);

impl SpriteKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Full-size avatar variant for a player.
    #[must_use]
    pub fn avatar_full(player: &PlayerId) -> Self {
        Self(format!("{player}.jpg"))
    }

    /// Blurred full-size avatar variant, used as the render background.
    #[must_use]
    pub fn avatar_blurred(player: &PlayerId) -> Self {
        Self(format!("{player}_blur.jpg"))
    }

    /// Cell-sized avatar variant carried by a snake's cells.
    #[must_use]
    pub fn avatar_small(player: &PlayerId) -> Self {
        Self(format!("{player}_small.jpg"))
    }

    /// Cell-sized blurred variant marking a segment absorbed from `player`.
    #[must_use]
    pub fn avatar_absorbed(player: &PlayerId) -> Self {
        Self(format!("{player}_blur_small.jpg"))
    }

    /// Cell-sized food sprite for a named food item.
    #[must_use]
    pub fn food_small(name: &str) -> Self {
        Self(format!("{name}_small.png"))
    }

    /// Relabel the `_small` variant as `_blur` once the cell has been
    /// absorbed. Pure key rewrite; no image is touched.
    #[must_use]
    pub fn to_absorbed(&self) -> Self {
        if self.0.contains("_small") {
            Self(self.0.replacen("_small", "_blur", 1))
        } else {
            Self(format!("{}_blur", self.0))
        }
    }
}

impl fmt::Display for SpriteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cardinal heading of a snake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// All four headings, in the order spawn sampling draws from.
    pub const ALL: [Self; 4] = [Self::Up, Self::Down, Self::Left, Self::Right];

    /// Grid delta applied per tick. Up decreases `y`.
    #[must_use]
    pub const fn delta(self) -> (i32, i32) {
        match self {
            Self::Up => (0, -1),
            Self::Down => (0, 1),
            Self::Left => (-1, 0),
            Self::Right => (1, 0),
        }
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

impl FromStr for Direction {
    type Err = GameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            other => Err(GameError::UnknownDirection(other.to_string())),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Toroidal wrap of a single axis value into `[0, extent)`.
#[inline]
#[must_use]
pub fn wrap_axis(value: i32, extent: u32) -> i32 {
    value.rem_euclid(extent as i32)
}

/// Toroidal wrap of a coordinate pair into `[0, w) × [0, h)`.
#[must_use]
pub fn wrap_position(x: i32, y: i32, width: u32, height: u32) -> (i32, i32) {
    (wrap_axis(x, width), wrap_axis(y, height))
}

/// One map cell: a wrapped coordinate plus the sprite drawn there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
    pub sprite: SpriteKey,
}

impl Cell {
    #[must_use]
    pub fn new(x: i32, y: i32, sprite: SpriteKey) -> Self {
        Self { x, y, sprite }
    }

    #[must_use]
    pub const fn coord(&self) -> (i32, i32) {
        (self.x, self.y)
    }
}

/// One player's snake: an ordered cell list (head first) and a heading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snake {
    pub id: PlayerId,
    pub cells: Vec<Cell>,
    pub direction: Direction,
}

impl Snake {
    #[must_use]
    pub fn new(id: PlayerId, head: Cell, direction: Direction) -> Self {
        Self {
            id,
            cells: vec![head],
            direction,
        }
    }

    /// Head cell, index 0. `None` only for a snake mid-removal.
    #[must_use]
    pub fn head(&self) -> Option<&Cell> {
        self.cells.first()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Whether the head overlaps any body cell at index > 0.
    #[must_use]
    pub fn hits_self(&self) -> bool {
        let Some(head) = self.head() else {
            return false;
        };
        self.cells
            .iter()
            .skip(1)
            .any(|cell| cell.coord() == head.coord())
    }

    /// Advance one cell along the current heading, toroidally wrapped.
    ///
    /// The new head keeps the previous head's sprite (per-player stable);
    /// every body slot keeps its own sprite while taking the coordinate of
    /// the slot one closer to the head, so a distinct absorbed sprite trails
    /// the body along its path instead of jumping to the head. The vacated
    /// former tail coordinate drops off; length is unchanged.
    pub fn advance(&mut self, width: u32, height: u32) {
        let Some(head) = self.cells.first() else {
            return;
        };
        let (dx, dy) = self.direction.delta();
        let (nx, ny) = wrap_position(head.x + dx, head.y + dy, width, height);

        let mut next = Vec::with_capacity(self.cells.len());
        next.push(Cell::new(nx, ny, head.sprite.clone()));
        for i in 1..self.cells.len() {
            next.push(Cell::new(
                self.cells[i - 1].x,
                self.cells[i - 1].y,
                self.cells[i].sprite.clone(),
            ));
        }
        self.cells = next;
    }

    /// Append one tail cell carrying `sprite`, using the growth geometry:
    /// a length-1 snake grows one step behind the head opposite its heading,
    /// a longer snake grows colinear one step beyond the current last cell.
    pub fn grow_tail(&mut self, sprite: SpriteKey, width: u32, height: u32) {
        match self.cells.len() {
            0 => {}
            1 => {
                let head = &self.cells[0];
                let (dx, dy) = self.direction.delta();
                let (x, y) = wrap_position(head.x - dx, head.y - dy, width, height);
                self.cells.push(Cell::new(x, y, sprite));
            }
            len => {
                let last = &self.cells[len - 1];
                let prev = &self.cells[len - 2];
                let (mut x, mut y) = last.coord();
                if x == prev.x {
                    if y < prev.y {
                        y -= 1;
                    } else {
                        y += 1;
                    }
                } else if y == prev.y {
                    if x < prev.x {
                        x -= 1;
                    } else {
                        x += 1;
                    }
                }
                let (x, y) = wrap_position(x, y, width, height);
                self.cells.push(Cell::new(x, y, sprite));
            }
        }
    }
}

/// Static configuration for one game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameConfig {
    /// Map width in cells.
    pub width: u32,
    /// Map height in cells.
    pub height: u32,
    /// Seconds between automatic moves.
    pub refresh_interval: i64,
    /// Optional RNG seed for reproducible spawn and food placement.
    pub rng_seed: Option<u64>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            width: 20,
            height: 20,
            refresh_interval: 3600,
            rng_seed: None,
        }
    }
}

impl GameConfig {
    /// Reject dimensions or intervals the simulation cannot run with.
    pub fn validate(&self) -> Result<(), GameError> {
        if self.width == 0 || self.height == 0 {
            return Err(GameError::InvalidConfig(
                "map dimensions must be non-zero",
            ));
        }
        if self.refresh_interval <= 0 {
            return Err(GameError::InvalidConfig(
                "refresh_interval must be positive",
            ));
        }
        Ok(())
    }
}

/// Errors raised by game construction and direction updates.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GameError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("unrecognized direction {0:?}")]
    UnknownDirection(String),
    #[error("no snake for player {0}")]
    SnakeNotFound(PlayerId),
}

/// The toroidal map: snakes keyed by player id plus free food cells.
///
/// Snakes live in a `BTreeMap` so every pass over them observes the same
/// sorted-id order; collision outcomes never depend on hash iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameMap {
    snakes: BTreeMap<PlayerId, Snake>,
    food: Vec<Cell>,
    width: u32,
    height: u32,
}

impl GameMap {
    /// Create an empty map with validated dimensions.
    pub fn new(width: u32, height: u32) -> Result<Self, GameError> {
        if width == 0 || height == 0 {
            return Err(GameError::InvalidConfig(
                "map dimensions must be non-zero",
            ));
        }
        Ok(Self {
            snakes: BTreeMap::new(),
            food: Vec::new(),
            width,
            height,
        })
    }

    /// Reassemble a map from persisted parts, re-wrapping every coordinate
    /// so loads can never violate the in-range invariant.
    pub fn from_parts(
        width: u32,
        height: u32,
        snakes: Vec<Snake>,
        food: Vec<Cell>,
    ) -> Result<Self, GameError> {
        let mut map = Self::new(width, height)?;
        for mut snake in snakes {
            if snake.is_empty() {
                continue;
            }
            for cell in &mut snake.cells {
                let (x, y) = wrap_position(cell.x, cell.y, width, height);
                cell.x = x;
                cell.y = y;
            }
            map.snakes.insert(snake.id.clone(), snake);
        }
        let mut seen = HashSet::new();
        for mut cell in food {
            let (x, y) = wrap_position(cell.x, cell.y, width, height);
            cell.x = x;
            cell.y = y;
            if seen.insert((x, y)) {
                map.food.push(cell);
            }
        }
        Ok(map)
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Living snakes in sorted-id order.
    pub fn snakes(&self) -> impl Iterator<Item = &Snake> {
        self.snakes.values()
    }

    #[must_use]
    pub fn snake(&self, player: &PlayerId) -> Option<&Snake> {
        self.snakes.get(player)
    }

    #[must_use]
    pub fn snake_count(&self) -> usize {
        self.snakes.len()
    }

    #[must_use]
    pub fn food(&self) -> &[Cell] {
        &self.food
    }

    /// Update a snake's heading; `SnakeNotFound` when the player has none.
    pub fn set_direction(
        &mut self,
        player: &PlayerId,
        direction: Direction,
    ) -> Result<(), GameError> {
        match self.snakes.get_mut(player) {
            Some(snake) => {
                snake.direction = direction;
                Ok(())
            }
            None => Err(GameError::SnakeNotFound(player.clone())),
        }
    }

    /// Whether any snake cell or food cell sits at `coord`.
    #[must_use]
    pub fn occupied(&self, coord: (i32, i32)) -> bool {
        self.food.iter().any(|cell| cell.coord() == coord)
            || self
                .snakes
                .values()
                .any(|snake| snake.cells.iter().any(|cell| cell.coord() == coord))
    }

    fn insert_snake(&mut self, snake: Snake) {
        self.snakes.insert(snake.id.clone(), snake);
    }

    fn push_food(&mut self, cell: Cell) {
        debug_assert!(
            !self.food.iter().any(|f| f.coord() == cell.coord()),
            "duplicate food coordinate"
        );
        self.food.push(cell);
    }

    /// Remove every snake whose head overlaps its own body. Returns the
    /// removed ids (sorted, since the map iterates sorted).
    pub fn remove_self_colliders(&mut self) -> Vec<PlayerId> {
        let doomed: Vec<PlayerId> = self
            .snakes
            .iter()
            .filter(|(_, snake)| snake.hits_self())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            self.snakes.remove(id);
        }
        doomed
    }

    /// One head-to-body collision pass over all living snakes.
    ///
    /// An occupancy index over non-head body cells is consulted per snake
    /// with that snake's own cells withdrawn, then refreshed before the next
    /// snake. The strictly longer snake eats the shorter; equal lengths are
    /// resolved in favour of the lexicographically smaller id. Eaten snakes
    /// are flagged and purged only after the full pass, so the index stays
    /// valid throughout; a flagged snake neither eats nor gets eaten again
    /// within the pass.
    pub fn resolve_head_to_body_collisions(&mut self) {
        let ids: Vec<PlayerId> = self.snakes.keys().cloned().collect();
        let mut flagged: HashSet<PlayerId> = HashSet::new();

        let mut occupancy: HashMap<(i32, i32), PlayerId> = HashMap::new();
        for (id, snake) in &self.snakes {
            for cell in snake.cells.iter().skip(1) {
                occupancy.insert(cell.coord(), id.clone());
            }
        }

        for id in &ids {
            if flagged.contains(id) {
                continue;
            }
            let Some(snake) = self.snakes.get(id) else {
                continue;
            };
            let Some(head) = snake.head() else {
                continue;
            };
            let head_coord = head.coord();

            // Withdraw this snake's own cells so its head test cannot see
            // them; they are re-inserted below for the snakes that follow.
            let own: Vec<(i32, i32)> = snake.cells.iter().map(Cell::coord).collect();
            for coord in &own {
                if occupancy.get(coord).is_some_and(|owner| owner == id) {
                    occupancy.remove(coord);
                }
            }

            if let Some(other) = occupancy.get(&head_coord).cloned() {
                if other != *id && !flagged.contains(&other) {
                    let len_a = self.snakes.get(id).map_or(0, Snake::len);
                    let len_b = self.snakes.get(&other).map_or(0, Snake::len);
                    let (eater, eaten) = if len_a > len_b {
                        (id.clone(), other)
                    } else if len_b > len_a {
                        (other, id.clone())
                    } else if *id < other {
                        (id.clone(), other)
                    } else {
                        (other, id.clone())
                    };
                    self.apply_eat(&eater, &eaten, &mut occupancy);
                    flagged.insert(eaten);
                }
            }

            if let Some(snake) = self.snakes.get(id) {
                if !flagged.contains(id) {
                    for cell in snake.cells.iter().skip(1) {
                        occupancy.insert(cell.coord(), id.clone());
                    }
                }
            }
        }

        for id in flagged {
            self.snakes.remove(&id);
        }
    }

    /// The eater gains one tail cell copied from the eaten snake's last cell,
    /// resprited to the eaten identity's absorbed variant. The eaten snake's
    /// remaining body is withdrawn from the occupancy index so nothing eats
    /// it twice.
    fn apply_eat(
        &mut self,
        eater: &PlayerId,
        eaten: &PlayerId,
        occupancy: &mut HashMap<(i32, i32), PlayerId>,
    ) {
        let tail = self
            .snakes
            .get(eaten)
            .and_then(|snake| snake.cells.last().cloned());
        if let Some(snake) = self.snakes.get(eaten) {
            for cell in &snake.cells {
                if occupancy.get(&cell.coord()).is_some_and(|owner| owner == eaten) {
                    occupancy.remove(&cell.coord());
                }
            }
        }
        if let (Some(tail), Some(eater_snake)) = (tail, self.snakes.get_mut(eater)) {
            eater_snake
                .cells
                .push(Cell::new(tail.x, tail.y, SpriteKey::avatar_absorbed(eaten)));
        }
    }

    /// Move every living snake exactly one cell.
    pub fn advance_snakes(&mut self) {
        let (width, height) = (self.width, self.height);
        for snake in self.snakes.values_mut() {
            snake.advance(width, height);
        }
    }

    /// Let heads claim food cells: first claim wins per cell, the claiming
    /// snake grows one tail cell carrying the food's blurred variant, and
    /// claimed cells leave the food list. Returns the claimed cells.
    pub fn claim_food_under_heads(&mut self) -> Vec<Cell> {
        if self.food.is_empty() {
            return Vec::new();
        }
        let mut taken = vec![false; self.food.len()];
        let mut eaten = Vec::new();
        let ids: Vec<PlayerId> = self.snakes.keys().cloned().collect();
        let (width, height) = (self.width, self.height);

        for id in &ids {
            let Some(head_coord) = self
                .snakes
                .get(id)
                .and_then(Snake::head)
                .map(Cell::coord)
            else {
                continue;
            };
            let claim = self
                .food
                .iter()
                .enumerate()
                .position(|(i, food)| !taken[i] && food.coord() == head_coord);
            if let Some(index) = claim {
                taken[index] = true;
                let food = self.food[index].clone();
                if let Some(snake) = self.snakes.get_mut(id) {
                    snake.grow_tail(food.sprite.to_absorbed(), width, height);
                }
                eaten.push(food);
            }
        }

        let mut keep = taken.iter();
        self.food.retain(|_| !*keep.next().unwrap_or(&false));
        eaten
    }

    /// One sub-tick: self-collision sweep, inter-snake eating pass, movement,
    /// then food claims at the freshly computed head positions.
    pub fn run_sub_tick(&mut self) -> Vec<Cell> {
        self.remove_self_colliders();
        self.resolve_head_to_body_collisions();
        self.advance_snakes();
        self.claim_food_under_heads()
    }
}

/// One chat group's persistent game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub group: GroupId,
    pub map: GameMap,
    /// Unix seconds of the last applied tick batch.
    pub last_refresh: i64,
    /// Seconds per tick.
    pub refresh_interval: i64,
}

/// Opaque error reported by persistence backends through the seam.
#[derive(Debug, Error)]
#[error("game store error: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Persistence seam consumed by the service layer; backends implement it,
/// tests substitute in-memory fakes.
pub trait GameStore {
    /// Fetch a group's game, `Ok(None)` when it has never been created.
    fn load_game(&mut self, group: &GroupId) -> Result<Option<Game>, StoreError>;

    /// Atomically upsert metadata, replace the full food set, and sync
    /// per-snake rows.
    fn save_game(&mut self, game: &Game) -> Result<(), StoreError>;
}

/// Drives catch-up ticks, lazy snake spawning, and food placement.
///
/// Holds the only RNG in the crate so seeded engines replay identically.
#[derive(Debug)]
pub struct SimulationEngine {
    rng: SmallRng,
}

impl SimulationEngine {
    /// Engine seeded from `seed`, or from entropy when absent.
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        };
        Self { rng }
    }

    /// Create a fresh game for `group`: empty snakes and one starting food
    /// cell, timestamped at `now`.
    pub fn create_game(
        &mut self,
        group: GroupId,
        config: &GameConfig,
        now: i64,
    ) -> Result<Game, GameError> {
        config.validate()?;
        let mut map = GameMap::new(config.width, config.height)?;
        let (x, y) = self.sample_cell(&map);
        map.push_food(Cell::new(x, y, SpriteKey::food_small("food")));
        Ok(Game {
            group,
            map,
            last_refresh: now,
            refresh_interval: config.refresh_interval,
        })
    }

    /// Advance the game by every refresh interval that elapsed up to `now`,
    /// returning the food cells consumed across the whole batch.
    ///
    /// This is the catch-up model: a game untouched for N intervals advances
    /// N sub-ticks atomically here, not via a background scheduler. When
    /// `joining` has no snake yet one is spawned and at least one sub-tick
    /// is forced so the newcomer is visible immediately. With zero due ticks
    /// and no spawn the call is a strict no-op: no field changes, not even
    /// `last_refresh`.
    pub fn advance_if_due(
        &mut self,
        game: &mut Game,
        now: i64,
        joining: &PlayerId,
    ) -> Vec<Cell> {
        let elapsed = (now - game.last_refresh).max(0);
        let mut ticks = elapsed / game.refresh_interval;

        if game.map.snake(joining).is_none() {
            self.spawn_snake(&mut game.map, joining);
            ticks = ticks.max(1);
        }
        if ticks == 0 {
            return Vec::new();
        }

        let mut eaten = Vec::new();
        for _ in 0..ticks {
            eaten.extend(game.map.run_sub_tick());
        }
        // The remainder below one interval is deliberately dropped.
        game.last_refresh = now;
        eaten
    }

    /// Spawn a length-1 snake for `player` at a rejection-sampled cell with
    /// a uniformly random heading.
    pub fn spawn_snake(&mut self, map: &mut GameMap, player: &PlayerId) {
        let mut coord = self.sample_cell(map);
        for _ in 0..SPAWN_SAMPLE_ATTEMPTS {
            if !map.occupied(coord) {
                break;
            }
            coord = self.sample_cell(map);
        }
        let direction = Direction::ALL[self.rng.gen_range(0..Direction::ALL.len())];
        let head = Cell::new(coord.0, coord.1, SpriteKey::avatar_small(player));
        map.insert_snake(Snake::new(player.clone(), head, direction));
    }

    /// Place a named food cell at a free coordinate, rejection-sampling
    /// against all snake and food occupancy. `None` when no free cell was
    /// found within the attempt budget.
    pub fn add_food(&mut self, map: &mut GameMap, name: &str) -> Option<Cell> {
        for _ in 0..FOOD_SAMPLE_ATTEMPTS {
            let coord = self.sample_cell(map);
            if !map.occupied(coord) {
                let cell = Cell::new(coord.0, coord.1, SpriteKey::food_small(name));
                map.push_food(cell.clone());
                return Some(cell);
            }
        }
        None
    }

    fn sample_cell(&mut self, map: &GameMap) -> (i32, i32) {
        (
            self.rng.gen_range(0..map.width() as i32),
            self.rng.gen_range(0..map.height() as i32),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(id: &str) -> PlayerId {
        PlayerId::new(id)
    }

    fn sprite(key: &str) -> SpriteKey {
        SpriteKey::new(key)
    }

    fn bare_map(width: u32, height: u32) -> GameMap {
        GameMap::new(width, height).expect("map")
    }

    fn snake_at(id: &str, cells: &[(i32, i32)], direction: Direction) -> Snake {
        let pid = player(id);
        let cells = cells
            .iter()
            .map(|&(x, y)| Cell::new(x, y, SpriteKey::avatar_small(&pid)))
            .collect();
        Snake {
            id: pid,
            cells,
            direction,
        }
    }

    #[test]
    fn wrap_is_idempotent_in_range_and_total() {
        for x in 0..7 {
            assert_eq!(wrap_axis(x, 7), x);
        }
        for value in [-1, -7, -8, 7, 13, 700, -700, i32::MIN / 2, i32::MAX / 2] {
            let wrapped = wrap_axis(value, 7);
            assert!((0..7).contains(&wrapped), "{value} wrapped to {wrapped}");
            assert_eq!(wrap_axis(wrapped, 7), wrapped);
        }
        assert_eq!(wrap_position(-1, 20, 20, 20), (19, 0));
    }

    #[test]
    fn direction_parsing_rejects_garbage() {
        assert_eq!("up".parse::<Direction>(), Ok(Direction::Up));
        assert_eq!(
            "north".parse::<Direction>(),
            Err(GameError::UnknownDirection("north".to_string()))
        );
        for direction in Direction::ALL {
            assert_eq!(direction.as_str().parse::<Direction>(), Ok(direction));
            assert_eq!(direction.opposite().opposite(), direction);
        }
    }

    #[test]
    fn sprite_variant_relabeling() {
        let p = player("alice");
        assert_eq!(SpriteKey::avatar_small(&p).as_str(), "alice_small.jpg");
        assert_eq!(
            SpriteKey::avatar_absorbed(&p).as_str(),
            "alice_blur_small.jpg"
        );
        assert_eq!(
            SpriteKey::food_small("apple").to_absorbed().as_str(),
            "apple_blur.png"
        );
        assert_eq!(sprite("plain").to_absorbed().as_str(), "plain_blur");
    }

    #[test]
    fn single_cell_snake_loops_around_the_torus() {
        let mut map = bare_map(5, 3);
        map.insert_snake(snake_at("a", &[(2, 1)], Direction::Right));
        for step in 1..=5 {
            map.run_sub_tick();
            let head = map.snake(&player("a")).unwrap().head().unwrap().coord();
            if step < 5 {
                assert_ne!(head, (2, 1), "returned early at step {step}");
            } else {
                assert_eq!(head, (2, 1));
            }
        }

        let mut map = bare_map(5, 3);
        map.insert_snake(snake_at("b", &[(0, 0)], Direction::Up));
        for _ in 0..3 {
            map.run_sub_tick();
        }
        assert_eq!(
            map.snake(&player("b")).unwrap().head().unwrap().coord(),
            (0, 0)
        );
    }

    #[test]
    fn head_sprite_stays_and_body_sprites_trail() {
        let pid = player("a");
        let mut snake = Snake {
            id: pid.clone(),
            cells: vec![
                Cell::new(3, 0, sprite("head")),
                Cell::new(2, 0, sprite("mid")),
                Cell::new(1, 0, sprite("tail")),
            ],
            direction: Direction::Right,
        };
        snake.advance(10, 10);
        assert_eq!(
            snake.cells,
            vec![
                Cell::new(4, 0, sprite("head")),
                Cell::new(3, 0, sprite("mid")),
                Cell::new(2, 0, sprite("tail")),
            ]
        );
    }

    #[test]
    fn self_collision_removes_snake_after_one_tick() {
        // Head at (2,2) moving left lands on (1,2), still occupied by the
        // shifted body; the next sub-tick's sweep removes the snake.
        let mut map = bare_map(10, 10);
        map.insert_snake(snake_at(
            "a",
            &[(2, 2), (2, 3), (1, 3), (1, 2), (0, 2)],
            Direction::Left,
        ));
        map.run_sub_tick();
        assert!(map.snake(&player("a")).is_some());
        map.run_sub_tick();
        assert!(map.snake(&player("a")).is_none());
        assert_eq!(map.snake_count(), 0);
    }

    #[test]
    fn longer_snake_eats_shorter_on_head_to_body_overlap() {
        let mut map = bare_map(12, 12);
        // a's head sits on b's body cell (5,5).
        map.insert_snake(snake_at(
            "a",
            &[(5, 5), (4, 5), (3, 5), (2, 5), (1, 5)],
            Direction::Right,
        ));
        map.insert_snake(snake_at("b", &[(5, 4), (5, 5)], Direction::Up));

        map.resolve_head_to_body_collisions();

        assert!(map.snake(&player("b")).is_none());
        let a = map.snake(&player("a")).unwrap();
        assert_eq!(a.len(), 6);
        let tail = a.cells.last().unwrap();
        assert_eq!(tail.coord(), (5, 5));
        assert_eq!(tail.sprite, SpriteKey::avatar_absorbed(&player("b")));
    }

    #[test]
    fn shorter_head_hitting_longer_body_loses() {
        let mut map = bare_map(12, 12);
        map.insert_snake(snake_at("a", &[(4, 5)], Direction::Right));
        map.insert_snake(snake_at(
            "b",
            &[(4, 4), (4, 5), (4, 6)],
            Direction::Up,
        ));
        // b's body occupies a's head cell; b is longer, so a is eaten even
        // though the pass visits a first.
        map.resolve_head_to_body_collisions();
        assert!(map.snake(&player("a")).is_none());
        assert_eq!(map.snake(&player("b")).unwrap().len(), 4);
    }

    #[test]
    fn equal_length_collision_breaks_tie_by_smaller_id() {
        let mut map = bare_map(12, 12);
        map.insert_snake(snake_at("bob", &[(5, 5), (4, 5)], Direction::Right));
        map.insert_snake(snake_at("amy", &[(6, 5), (5, 5)], Direction::Down));
        // bob's head overlaps amy's body cell at (5,5); lengths tie, so the
        // lexicographically smaller id wins.
        map.resolve_head_to_body_collisions();
        assert!(map.snake(&player("bob")).is_none());
        assert_eq!(map.snake(&player("amy")).unwrap().len(), 3);
    }

    #[test]
    fn flagged_snake_cannot_eat_within_the_same_pass() {
        let mut map = bare_map(12, 12);
        // amy eats bob; bob's head also overlaps cal's body, but once bob is
        // flagged his collision must not resolve.
        map.insert_snake(snake_at(
            "amy",
            &[(2, 2), (1, 2), (0, 2)],
            Direction::Right,
        ));
        map.insert_snake(snake_at("bob", &[(7, 7), (2, 2)], Direction::Up));
        map.insert_snake(snake_at("cal", &[(7, 6), (7, 7)], Direction::Up));
        // amy's head (2,2) sits on bob's body; bob's head (7,7) sits on cal's
        // body. amy is longer than bob, bob ties cal but is flagged first.
        map.resolve_head_to_body_collisions();
        assert!(map.snake(&player("bob")).is_none());
        assert!(map.snake(&player("amy")).is_some());
        assert_eq!(map.snake(&player("cal")).unwrap().len(), 2);
    }

    #[test]
    fn food_at_next_head_cell_is_claimed_in_the_same_sub_tick() {
        let mut map = bare_map(10, 10);
        map.insert_snake(snake_at("a", &[(3, 3)], Direction::Right));
        map.push_food(Cell::new(4, 3, SpriteKey::food_small("apple")));

        let eaten = map.run_sub_tick();

        assert_eq!(eaten.len(), 1);
        assert_eq!(eaten[0].coord(), (4, 3));
        assert!(map.food().is_empty());
        let snake = map.snake(&player("a")).unwrap();
        assert_eq!(snake.len(), 2);
        // Length-1 growth lands one step behind the head, opposite heading.
        assert_eq!(snake.cells[1].coord(), (3, 3));
        assert_eq!(snake.cells[1].sprite.as_str(), "apple_blur.png");
    }

    #[test]
    fn tail_growth_extends_colinear_beyond_the_last_cell() {
        let mut snake = snake_at("a", &[(5, 5), (4, 5), (3, 5)], Direction::Right);
        snake.grow_tail(sprite("g"), 10, 10);
        assert_eq!(snake.cells.last().unwrap().coord(), (2, 5));

        let mut snake = snake_at("b", &[(0, 0), (0, 1)], Direction::Up);
        snake.grow_tail(sprite("g"), 10, 10);
        // Tail heads downward, growth continues downward and wraps.
        assert_eq!(snake.cells.last().unwrap().coord(), (0, 2));

        let mut wrapping = snake_at("c", &[(0, 5), (1, 5)], Direction::Left);
        wrapping.grow_tail(sprite("g"), 10, 10);
        assert_eq!(wrapping.cells.last().unwrap().coord(), (2, 5));
    }

    #[test]
    fn first_claim_wins_when_two_heads_share_a_food_cell() {
        let mut map = bare_map(10, 10);
        map.insert_snake(snake_at("amy", &[(4, 4)], Direction::Up));
        map.insert_snake(snake_at("bob", &[(4, 4)], Direction::Down));
        map.push_food(Cell::new(4, 4, SpriteKey::food_small("apple")));

        let eaten = map.claim_food_under_heads();
        assert_eq!(eaten.len(), 1);
        assert_eq!(map.snake(&player("amy")).unwrap().len(), 2);
        assert_eq!(map.snake(&player("bob")).unwrap().len(), 1);
    }

    #[test]
    fn set_direction_errors_for_unknown_player() {
        let mut map = bare_map(10, 10);
        assert_eq!(
            map.set_direction(&player("ghost"), Direction::Up),
            Err(GameError::SnakeNotFound(player("ghost")))
        );
        map.insert_snake(snake_at("a", &[(1, 1)], Direction::Up));
        map.set_direction(&player("a"), Direction::Left).unwrap();
        assert_eq!(map.snake(&player("a")).unwrap().direction, Direction::Left);
    }

    #[test]
    fn engine_spawns_joining_player_and_forces_one_tick() {
        let mut engine = SimulationEngine::new(Some(7));
        let mut game = engine
            .create_game(GroupId::new("g"), &GameConfig::default(), 1_000)
            .expect("game");
        assert_eq!(game.map.food().len(), 1);

        let joining = player("alice");
        engine.advance_if_due(&mut game, 1_000, &joining);
        let snake = game.map.snake(&joining).expect("spawned");
        assert_eq!(snake.len(), 1);
        assert_eq!(snake.cells[0].sprite, SpriteKey::avatar_small(&joining));
        let head = snake.head().unwrap();
        assert!((0..20).contains(&head.x) && (0..20).contains(&head.y));
        // The forced tick moved the batch clock forward.
        assert_eq!(game.last_refresh, 1_000);
    }

    #[test]
    fn advance_inside_one_interval_is_bit_for_bit_idempotent() {
        let mut engine = SimulationEngine::new(Some(3));
        let config = GameConfig {
            refresh_interval: 60,
            ..GameConfig::default()
        };
        let mut game = engine
            .create_game(GroupId::new("g"), &config, 0)
            .expect("game");
        let joining = player("alice");
        engine.advance_if_due(&mut game, 0, &joining);

        let before = game.clone();
        assert!(engine.advance_if_due(&mut game, 30, &joining).is_empty());
        assert_eq!(game, before);
        assert!(engine.advance_if_due(&mut game, 59, &joining).is_empty());
        assert_eq!(game, before);
    }

    #[test]
    fn catch_up_runs_floor_of_elapsed_over_interval_ticks() {
        let mut engine = SimulationEngine::new(Some(5));
        let config = GameConfig {
            width: 200,
            height: 200,
            refresh_interval: 60,
            rng_seed: Some(5),
        };
        let mut game = engine
            .create_game(GroupId::new("g"), &config, 0)
            .expect("game");
        let pid = player("p");
        let start = Cell::new(10, 10, SpriteKey::avatar_small(&pid));
        game.map
            .insert_snake(Snake::new(pid.clone(), start, Direction::Right));
        game.map.food.clear();

        engine.advance_if_due(&mut game, 185, &pid);

        // 185 / 60 floors to exactly 3 ticks: 3 cells travelled, no more.
        assert_eq!(
            game.map.snake(&pid).unwrap().head().unwrap().coord(),
            (13, 10)
        );
        assert_eq!(game.last_refresh, 185);
    }

    #[test]
    fn seeded_engines_replay_identically() {
        let run = || {
            let mut engine = SimulationEngine::new(Some(0xDEAD_BEEF));
            let mut game = engine
                .create_game(GroupId::new("g"), &GameConfig::default(), 0)
                .expect("game");
            for name in ["amy", "bob", "cal"] {
                engine.advance_if_due(&mut game, 0, &player(name));
            }
            engine.add_food(&mut game.map, "apple");
            game
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn add_food_avoids_occupied_cells() {
        let mut engine = SimulationEngine::new(Some(11));
        let mut map = bare_map(3, 3);
        // Occupy everything except (2,2).
        for (i, coord) in [(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1), (0, 2)]
            .iter()
            .enumerate()
        {
            map.push_food(Cell::new(coord.0, coord.1, SpriteKey::food_small(&format!("f{i}"))));
        }
        map.insert_snake(snake_at("a", &[(1, 2)], Direction::Up));

        let placed = engine.add_food(&mut map, "apple").expect("free cell left");
        assert_eq!(placed.coord(), (2, 2));

        // Map now full: placement gives up instead of looping forever.
        assert!(engine.add_food(&mut map, "pear").is_none());
    }

    #[test]
    fn config_validation_rejects_degenerate_settings() {
        let bad = GameConfig {
            width: 0,
            ..GameConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = GameConfig {
            refresh_interval: 0,
            ..GameConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!(GameConfig::default().validate().is_ok());
    }

    #[test]
    fn from_parts_rewraps_and_deduplicates() {
        let pid = player("a");
        let snakes = vec![Snake {
            id: pid.clone(),
            cells: vec![Cell::new(-1, 25, SpriteKey::avatar_small(&pid))],
            direction: Direction::Up,
        }];
        let food = vec![
            Cell::new(21, 1, SpriteKey::food_small("a")),
            Cell::new(1, 1, SpriteKey::food_small("b")),
        ];
        let map = GameMap::from_parts(20, 20, snakes, food).expect("map");
        assert_eq!(map.snake(&pid).unwrap().head().unwrap().coord(), (19, 5));
        // (21,1) wraps onto (1,1); the duplicate coordinate is dropped.
        assert_eq!(map.food().len(), 1);
    }
}
