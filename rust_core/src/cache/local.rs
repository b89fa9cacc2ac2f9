//! Per-process read cache of live games
//!
//! Reads and the read-modify-write in [`LocalGamesCache::update`] happen under
//! one lock with no await point, so events for a game processed by this
//! worker are applied in arrival order.

use crate::models::Game;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct LocalGamesCache {
    games: RwLock<FxHashMap<String, Arc<Game>>>,
}

impl LocalGamesCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, game_id: &str) -> Option<Arc<Game>> {
        self.games.read().get(game_id).cloned()
    }

    pub fn insert(&self, game: Game) -> Arc<Game> {
        let game = Arc::new(game);
        self.games.write().insert(game.id.clone(), game.clone());
        game
    }

    /// Replace a cached game with the result of `mutate`, if it returns one.
    /// Returns the stored snapshot when something changed.
    pub fn update<F>(&self, game_id: &str, mutate: F) -> Option<Arc<Game>>
    where
        F: FnOnce(&Game) -> Option<Game>,
    {
        let mut games = self.games.write();
        let current = games.get(game_id)?;
        let next = Arc::new(mutate(current)?);
        games.insert(game_id.to_string(), next.clone());
        Some(next)
    }

    /// Drop everything and load `games`
    pub fn replace_all(&self, games: impl IntoIterator<Item = Game>) {
        let fresh: FxHashMap<String, Arc<Game>> = games
            .into_iter()
            .map(|game| (game.id.clone(), Arc::new(game)))
            .collect();
        *self.games.write() = fresh;
    }

    pub fn remove(&self, game_id: &str) -> Option<Arc<Game>> {
        self.games.write().remove(game_id)
    }

    pub fn len(&self) -> usize {
        self.games.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::game::fixtures::{game, moneyline_game};

    #[test]
    fn test_update_only_stores_changed_games() {
        let cache = LocalGamesCache::new();
        let original = cache.insert(moneyline_game());

        assert!(cache.update("game-1", |_| None).is_none());
        assert!(Arc::ptr_eq(&cache.get("game-1").unwrap(), &original));

        let updated = cache
            .update("game-1", |g| {
                let mut next = g.clone();
                next.ended = true;
                Some(next)
            })
            .unwrap();
        assert!(updated.ended);
        assert!(cache.get("game-1").unwrap().ended);

        assert!(cache.update("missing", |g| Some(g.clone())).is_none());
    }

    #[test]
    fn test_replace_all_discards_previous_games() {
        let cache = LocalGamesCache::new();
        cache.insert(moneyline_game());
        cache.replace_all(vec![game("game-2", "b", vec![]), game("game-3", "c", vec![])]);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("game-1").is_none());
        assert!(cache.remove("game-2").is_some());
        assert_eq!(cache.len(), 1);
    }
}
