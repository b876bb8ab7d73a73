//! Pause coordination
//!
//! Two independent mechanisms:
//! - the auto-pause set: player ids the native side should pause on, mirrored
//!   locally so it can be replayed after a reconnect
//! - manual pause: an OS-visible named lock held while the game is paused

use crate::connector::Connector;
use crate::protocol::NativeMessage;
use civ_bridge_core::{BridgeError, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// OS-visible named lock meaning "game is manually paused"
pub trait PauseLock: Send + Sync {
    /// Whether the host supports this lock at all
    fn is_available(&self) -> bool;

    /// Take the lock; true on success
    fn acquire(&self) -> bool;

    /// Drop the lock; true on success
    fn release(&self) -> bool;

    fn is_held(&self) -> bool;
}

/// Lock backed by a marker file other processes can observe
pub struct FilePauseLock {
    path: PathBuf,
    held: Mutex<bool>,
}

impl FilePauseLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: Mutex::new(false),
        }
    }

    /// Lock named `name` inside `dir`, if `dir` is a writable directory
    pub fn in_dir(dir: &Path, name: &str) -> Option<Self> {
        let metadata = std::fs::metadata(dir).ok()?;
        if !metadata.is_dir() || metadata.permissions().readonly() {
            return None;
        }
        Some(Self::new(dir.join(format!("{}.lock", name))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PauseLock for FilePauseLock {
    fn is_available(&self) -> bool {
        true
    }

    fn acquire(&self) -> bool {
        let mut held = self.held.lock();
        if *held {
            return true;
        }
        match std::fs::write(&self.path, std::process::id().to_string()) {
            Ok(()) => {
                *held = true;
                true
            }
            Err(e) => {
                warn!("Failed to create pause lock {}: {}", self.path.display(), e);
                false
            }
        }
    }

    fn release(&self) -> bool {
        let mut held = self.held.lock();
        if !*held {
            return true;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                *held = false;
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *held = false;
                true
            }
            Err(e) => {
                warn!("Failed to remove pause lock {}: {}", self.path.display(), e);
                false
            }
        }
    }

    fn is_held(&self) -> bool {
        *self.held.lock()
    }
}

impl Drop for FilePauseLock {
    fn drop(&mut self) {
        if *self.held.get_mut() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Stand-in when the host has no usable lock primitive
pub struct NoopPauseLock;

impl PauseLock for NoopPauseLock {
    fn is_available(&self) -> bool {
        false
    }

    fn acquire(&self) -> bool {
        false
    }

    fn release(&self) -> bool {
        false
    }

    fn is_held(&self) -> bool {
        false
    }
}

/// Pick the lock implementation for this host
pub fn pause_lock_for_host(name: &str) -> Box<dyn PauseLock> {
    match FilePauseLock::in_dir(&std::env::temp_dir(), name) {
        Some(lock) => {
            debug!("Manual pause lock at {}", lock.path().display());
            Box::new(lock)
        }
        None => {
            warn!("No writable temp directory; manual pause unavailable");
            Box::new(NoopPauseLock)
        }
    }
}

/// Tracks auto-pause players and the manual pause lock
pub struct PauseCoordinator {
    connector: Arc<Connector>,
    players: Mutex<BTreeSet<u32>>,
    max_players: u32,
    lock: Box<dyn PauseLock>,
}

impl PauseCoordinator {
    pub fn new(connector: Arc<Connector>, max_players: u32, lock: Box<dyn PauseLock>) -> Self {
        Self {
            connector,
            players: Mutex::new(BTreeSet::new()),
            max_players,
            lock,
        }
    }

    /// Add a player to the auto-pause set and tell the native side
    pub async fn register_paused_player(&self, player_id: u32) -> Result<()> {
        self.check_player(player_id)?;
        self.players.lock().insert(player_id);
        self.notify(NativeMessage::PausePlayer { player_id }).await;
        Ok(())
    }

    /// Remove a player from the auto-pause set and tell the native side
    pub async fn unregister_paused_player(&self, player_id: u32) -> Result<()> {
        self.check_player(player_id)?;
        self.players.lock().remove(&player_id);
        self.notify(NativeMessage::UnpausePlayer { player_id }).await;
        Ok(())
    }

    /// Empty the set; the native side is told once, and only if it was non-empty
    pub async fn clear_paused_players(&self) -> usize {
        let cleared = {
            let mut players = self.players.lock();
            let count = players.len();
            players.clear();
            count
        };
        if cleared > 0 {
            self.notify(NativeMessage::ClearPausedPlayers).await;
        }
        cleared
    }

    pub fn paused_players(&self) -> Vec<u32> {
        self.players.lock().iter().copied().collect()
    }

    /// Replay every paused player after a reconnect; returns how many were sent
    pub async fn resync(&self) -> usize {
        let players = self.paused_players();
        let mut sent = 0;
        for player_id in players {
            match self
                .connector
                .send_no_wait(NativeMessage::PausePlayer { player_id })
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to resync paused player {}: {}", player_id, e),
            }
        }
        if sent > 0 {
            info!("Resynced {} paused player(s)", sent);
        }
        sent
    }

    /// Mirror the native side dropping its auto-pause state on disconnect
    pub fn clear_local(&self) {
        let mut players = self.players.lock();
        if !players.is_empty() {
            debug!("Forgetting {} paused player(s) after disconnect", players.len());
            players.clear();
        }
    }

    /// Take the manual pause lock; false if the host cannot provide it
    pub fn pause_game(&self) -> bool {
        if !self.lock.is_available() {
            return false;
        }
        if self.lock.is_held() {
            return true;
        }
        let acquired = self.lock.acquire();
        if acquired {
            info!("Game manually paused");
        }
        acquired
    }

    /// Release the manual pause lock; false if the host cannot provide it
    pub fn resume_game(&self) -> bool {
        if !self.lock.is_available() {
            return false;
        }
        if !self.lock.is_held() {
            return true;
        }
        let released = self.lock.release();
        if released {
            info!("Game manually resumed");
        }
        released
    }

    pub fn is_manually_paused(&self) -> bool {
        self.lock.is_held()
    }

    /// Release the manual pause lock if still held
    pub fn shutdown(&self) {
        if self.lock.is_held() && !self.lock.release() {
            warn!("Manual pause lock could not be released on shutdown");
        }
    }

    fn check_player(&self, player_id: u32) -> Result<()> {
        if player_id >= self.max_players {
            return Err(BridgeError::InvalidArguments(format!(
                "player id must be between 0 and {}: {}",
                self.max_players - 1,
                player_id
            )));
        }
        Ok(())
    }

    async fn notify(&self, message: NativeMessage) {
        let kind = message.kind();
        if let Err(e) = self.connector.send_no_wait(message).await {
            debug!("Skipped {} notification: {}", kind, e);
        }
    }
}
