//! Command-line entry point: run one board request against the configured
//! database and write the composited image to the output directory.
//!
//! Usage: `chatsnake <group> <player> [direction]`. An optional config path
//! comes from `CHATSNAKE_CONFIG`, defaulting to `chatsnake.json` beside the
//! binary; the file is created with defaults on first run.

use anyhow::{bail, Context, Result};
use chatsnake_app::{AppConfig, BoardRequest, GameService};
use chatsnake_core::{GroupId, PlayerId};
use chatsnake_render::{Compositor, LayerCache, RenderConfig};
use chatsnake_sprites::SpriteTable;
use chatsnake_storage::GameStorage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let mut args = std::env::args().skip(1);
    let (Some(group), Some(player)) = (args.next(), args.next()) else {
        bail!("usage: chatsnake <group> <player> [direction]");
    };
    let direction = args.next();

    let config_path = std::env::var_os("CHATSNAKE_CONFIG")
        .map_or_else(|| PathBuf::from("chatsnake.json"), PathBuf::from);
    let config = AppConfig::load_or_create(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;

    let sprites = Arc::new(SpriteTable::new());
    if config.sprite_dir.is_dir() {
        let loaded = sprites
            .load_directory(&config.sprite_dir)
            .with_context(|| format!("loading sprites from {}", config.sprite_dir.display()))?;
        info!(loaded, dir = %config.sprite_dir.display(), "sprites ready");
    } else {
        warn!(dir = %config.sprite_dir.display(), "sprite directory missing, using fallbacks");
    }

    let storage = GameStorage::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    let compositor = Compositor::new(
        sprites,
        Arc::new(LayerCache::new()),
        RenderConfig {
            cell_size: config.cell_size,
            ..RenderConfig::default()
        },
    );
    let mut service = GameService::new(storage, compositor, config.game.clone());

    let group = GroupId::new(group);
    let player = PlayerId::new(player);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before the epoch")?
        .as_secs() as i64;

    if let Some(direction) = direction {
        // Direction changes still advance and render so the sender sees the
        // board state their command applies to.
        service.advance_and_render(&BoardRequest {
            group: group.clone(),
            player: player.clone(),
            now,
        })?;
        service.set_direction(&group, &player, &direction)?;
        info!(%group, %player, %direction, "direction updated");
    }

    let board = service.advance_and_render(&BoardRequest {
        group: group.clone(),
        player: player.clone(),
        now,
    })?;

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating {}", config.output_dir.display()))?;
    let out = config.output_dir.join(format!("{group}.png"));
    board
        .save(&out)
        .with_context(|| format!("writing {}", out.display()))?;
    info!(board = %out.display(), "board written");
    println!("{}", out.display());
    Ok(())
}
