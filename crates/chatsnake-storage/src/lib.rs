//! DuckDB persistence for games.
//!
//! One database holds every group's game across three tables: `games` for
//! per-group metadata, `snakes` for per-player bodies (cell lists stored as
//! JSON), and `foods` for free food cells. Saves are transactional and
//! replace a group's rows wholesale, so a reload always reproduces exactly
//! the state that was saved; in particular, rows for snakes eaten since the
//! previous save disappear rather than lingering as stale upserts.

use chatsnake_core::{
    Cell, Direction, Game, GameMap, GameStore, GroupId, PlayerId, Snake, StoreError,
};
use duckdb::{params, Connection};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),
    #[error("cell serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// DuckDB-backed game store.
pub struct GameStorage {
    conn: Connection,
}

impl GameStorage {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let storage = Self { conn };
        storage.initialize_schema()?;
        info!(db = %path.display(), "opened game database");
        Ok(storage)
    }

    /// Purely in-memory store, handy for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let storage = Self { conn };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "create table if not exists games (
                group_id varchar primary key,
                width integer not null,
                height integer not null,
                last_refresh bigint not null,
                refresh_interval bigint not null
            );
            create table if not exists snakes (
                group_id varchar not null,
                player_id varchar not null,
                direction varchar not null,
                cells varchar not null,
                primary key (group_id, player_id)
            );
            create table if not exists foods (
                group_id varchar not null,
                idx integer not null,
                x integer not null,
                y integer not null,
                sprite varchar not null,
                primary key (group_id, idx)
            );",
        )?;
        Ok(())
    }

    /// Load one group's game. `Ok(None)` when the group has never saved.
    pub fn load(&mut self, group: &GroupId) -> Result<Option<Game>, StorageError> {
        let header = {
            let mut stmt = self.conn.prepare(
                "select width, height, last_refresh, refresh_interval
                 from games where group_id = ?",
            )?;
            let mut rows = stmt.query(params![group.as_str()])?;
            match rows.next()? {
                Some(row) => Some((
                    row.get::<_, u32>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                )),
                None => None,
            }
        };
        let Some((width, height, last_refresh, refresh_interval)) = header else {
            return Ok(None);
        };

        let snakes = self.load_snakes(group)?;
        let food = self.load_foods(group)?;
        let map = GameMap::from_parts(width, height, snakes, food)
            .map_err(|err| StorageError::Corrupt(err.to_string()))?;

        debug!(group = %group, snakes = map.snake_count(), "loaded game");
        Ok(Some(Game {
            group: group.clone(),
            map,
            last_refresh,
            refresh_interval,
        }))
    }

    fn load_snakes(&self, group: &GroupId) -> Result<Vec<Snake>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("select player_id, direction, cells from snakes where group_id = ?")?;
        let mut rows = stmt.query(params![group.as_str()])?;
        let mut snakes = Vec::new();
        while let Some(row) = rows.next()? {
            let player: String = row.get(0)?;
            let direction: String = row.get(1)?;
            let cells: String = row.get(2)?;
            let direction = direction
                .parse::<Direction>()
                .map_err(|err| StorageError::Corrupt(err.to_string()))?;
            let cells: Vec<Cell> = serde_json::from_str(&cells)?;
            snakes.push(Snake {
                id: PlayerId::new(player),
                cells,
                direction,
            });
        }
        Ok(snakes)
    }

    fn load_foods(&self, group: &GroupId) -> Result<Vec<Cell>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("select x, y, sprite from foods where group_id = ? order by idx")?;
        let mut rows = stmt.query(params![group.as_str()])?;
        let mut foods = Vec::new();
        while let Some(row) = rows.next()? {
            foods.push(Cell {
                x: row.get(0)?,
                y: row.get(1)?,
                sprite: chatsnake_core::SpriteKey::new(row.get::<_, String>(2)?),
            });
        }
        Ok(foods)
    }

    /// Persist one game atomically, replacing the group's rows wholesale.
    pub fn save(&mut self, game: &Game) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        let group = game.group.as_str();

        tx.execute("delete from games where group_id = ?", params![group])?;
        tx.execute(
            "insert into games (group_id, width, height, last_refresh, refresh_interval)
             values (?, ?, ?, ?, ?)",
            params![
                group,
                game.map.width(),
                game.map.height(),
                game.last_refresh,
                game.refresh_interval
            ],
        )?;

        tx.execute("delete from snakes where group_id = ?", params![group])?;
        {
            let mut stmt = tx.prepare(
                "insert into snakes (group_id, player_id, direction, cells)
                 values (?, ?, ?, ?)",
            )?;
            for snake in game.map.snakes() {
                let cells = serde_json::to_string(&snake.cells)?;
                stmt.execute(params![
                    group,
                    snake.id.as_str(),
                    snake.direction.as_str(),
                    cells
                ])?;
            }
        }

        tx.execute("delete from foods where group_id = ?", params![group])?;
        {
            let mut stmt = tx.prepare(
                "insert into foods (group_id, idx, x, y, sprite) values (?, ?, ?, ?, ?)",
            )?;
            for (idx, food) in game.map.food().iter().enumerate() {
                stmt.execute(params![
                    group,
                    idx as i64,
                    food.x,
                    food.y,
                    food.sprite.as_str()
                ])?;
            }
        }

        tx.commit()?;
        debug!(group = %game.group, "saved game");
        Ok(())
    }
}

impl GameStore for GameStorage {
    fn load_game(&mut self, group: &GroupId) -> Result<Option<Game>, StoreError> {
        self.load(group).map_err(|err| StoreError::new(err.to_string()))
    }

    fn save_game(&mut self, game: &Game) -> Result<(), StoreError> {
        self.save(game).map_err(|err| StoreError::new(err.to_string()))
    }
}
