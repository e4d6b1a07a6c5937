//! Pathfinding and map-grid collaborators.
//!
//! The walk coordinator only depends on the `Pathfinder` and `MapLoader`
//! traits. `GridPathfinder` and `OpenMapLoader` are simple implementations
//! used by the simulator and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance
    pub fn distance(&self, other: Position) -> f64 {
        f64::from(self.x - other.x).hypot(f64::from(self.y - other.y))
    }
}

/// Walkability grid of one map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapGrid {
    pub map_id: i32,
    pub width: i32,
    pub height: i32,
    /// Row-major, `true` where the entity can stand
    cells: Vec<bool>,
}

impl MapGrid {
    pub fn new(map_id: i32, width: i32, height: i32, cells: Vec<bool>) -> Option<Self> {
        if width <= 0 || height <= 0 || cells.len() != (width * height) as usize {
            return None;
        }
        Some(Self {
            map_id,
            width,
            height,
            cells,
        })
    }

    /// A grid where every cell is walkable
    pub fn open(map_id: i32, width: i32, height: i32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        Self {
            map_id,
            width,
            height,
            cells: vec![true; (width * height) as usize],
        }
    }

    pub fn contains(&self, pos: Position) -> bool {
        pos.x >= 0 && pos.y >= 0 && pos.x < self.width && pos.y < self.height
    }

    pub fn walkable(&self, pos: Position) -> bool {
        self.contains(pos) && self.cells[(pos.y * self.width + pos.x) as usize]
    }

    pub fn set_walkable(&mut self, pos: Position, walkable: bool) {
        if self.contains(pos) {
            self.cells[(pos.y * self.width + pos.x) as usize] = walkable;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("map {0} is unknown")]
    Unknown(i32),
}

/// Computes a route on a map grid.
///
/// The returned path excludes `from` and ends at `to`; an empty path means
/// there is no route.
pub trait Pathfinder: Send + Sync + 'static {
    fn find_path(&self, from: Position, to: Position, grid: &MapGrid) -> Vec<Position>;
}

pub trait MapLoader: Send + Sync + 'static {
    fn load_map(&self, map_id: i32) -> Result<MapGrid, MapError>;
}

impl<L: MapLoader + ?Sized> MapLoader for Box<L> {
    fn load_map(&self, map_id: i32) -> Result<MapGrid, MapError> {
        (**self).load_map(map_id)
    }
}

/// Memoises grids by map id
pub struct CachedMapLoader<L> {
    inner: L,
    cache: Mutex<HashMap<i32, Arc<MapGrid>>>,
}

impl<L: MapLoader> CachedMapLoader<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn load(&self, map_id: i32) -> Result<Arc<MapGrid>, MapError> {
        if let Some(grid) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&map_id)
        {
            return Ok(Arc::clone(grid));
        }

        // Loaded outside the lock; a concurrent miss just loads twice
        let grid = Arc::new(self.inner.load_map(map_id)?);
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(map_id, Arc::clone(&grid));
        Ok(grid)
    }

    pub fn cached_maps(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Serves open grids of a fixed size for any map id
#[derive(Debug, Clone, Copy)]
pub struct OpenMapLoader {
    pub width: i32,
    pub height: i32,
}

impl MapLoader for OpenMapLoader {
    fn load_map(&self, map_id: i32) -> Result<MapGrid, MapError> {
        Ok(MapGrid::open(map_id, self.width, self.height))
    }
}

/// Breadth-first search over the 8-connected grid
#[derive(Debug, Clone, Copy, Default)]
pub struct GridPathfinder;

const NEIGHBOURS: [(i32, i32); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (1, -1),
    (-1, 1),
    (-1, -1),
];

impl Pathfinder for GridPathfinder {
    fn find_path(&self, from: Position, to: Position, grid: &MapGrid) -> Vec<Position> {
        if !grid.walkable(to) {
            return Vec::new();
        }
        if from == to {
            return vec![to];
        }

        let mut came_from: HashMap<Position, Position> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        came_from.insert(from, from);

        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut path = vec![to];
                let mut node = to;
                while let Some(&prev) = came_from.get(&node) {
                    if prev == from {
                        break;
                    }
                    path.push(prev);
                    node = prev;
                }
                path.reverse();
                return path;
            }
            for (dx, dy) in NEIGHBOURS {
                let next = Position::new(current.x + dx, current.y + dy);
                if grid.walkable(next) && !came_from.contains_key(&next) {
                    came_from.insert(next, current);
                    queue.push_back(next);
                }
            }
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader(AtomicUsize);

    impl MapLoader for CountingLoader {
        fn load_map(&self, map_id: i32) -> Result<MapGrid, MapError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if map_id < 0 {
                return Err(MapError::Unknown(map_id));
            }
            Ok(MapGrid::open(map_id, 4, 4))
        }
    }

    #[test]
    fn test_map_loader_caches_by_id() {
        let loader = CachedMapLoader::new(CountingLoader(AtomicUsize::new(0)));
        loader.load(1).unwrap();
        loader.load(1).unwrap();
        loader.load(2).unwrap();
        assert!(loader.load(-1).is_err());

        assert_eq!(loader.inner.0.load(Ordering::SeqCst), 3);
        assert_eq!(loader.cached_maps(), 2);
    }

    #[test]
    fn test_path_ends_at_target() {
        let grid = MapGrid::open(1, 20, 20);
        let path = GridPathfinder.find_path(Position::new(0, 0), Position::new(10, 3), &grid);
        assert_eq!(path.last(), Some(&Position::new(10, 3)));
        assert!(!path.contains(&Position::new(0, 0)));
        assert_eq!(path.len(), 10);
    }

    #[test]
    fn test_no_path_when_walled_off() {
        let mut grid = MapGrid::open(1, 5, 5);
        for y in 0..5 {
            grid.set_walkable(Position::new(2, y), false);
        }
        let path = GridPathfinder.find_path(Position::new(0, 0), Position::new(4, 4), &grid);
        assert!(path.is_empty());
    }

    #[test]
    fn test_no_path_to_blocked_target() {
        let mut grid = MapGrid::open(1, 5, 5);
        grid.set_walkable(Position::new(3, 3), false);
        assert!(GridPathfinder
            .find_path(Position::new(0, 0), Position::new(3, 3), &grid)
            .is_empty());
        assert!(GridPathfinder
            .find_path(Position::new(0, 0), Position::new(9, 9), &grid)
            .is_empty());
    }

    #[test]
    fn test_distance() {
        assert_eq!(Position::new(0, 0).distance(Position::new(3, 4)), 5.0);
    }

    #[test]
    fn test_grid_rejects_bad_dimensions() {
        assert!(MapGrid::new(1, 2, 2, vec![true; 3]).is_none());
        assert!(MapGrid::new(1, 2, 2, vec![true; 4]).is_some());
    }
}
