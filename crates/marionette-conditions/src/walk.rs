//! Movement arbitration.
//!
//! Any number of running conditions may walk at once. Every movement command
//! they produce goes through one queue drained by a single worker, so the game
//! client only ever sees complete `(x, y, with_companion)` requests in
//! submission order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use marionette_client::config::WalkConfig;
use marionette_client::{CachedMapLoader, GameApi, MapLoader, Pathfinder, Position, SharedState};
use marionette_events::WalkRequest;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::blocking::BlockingPool;
use crate::registry::ConditionId;
use crate::scheduler::Scheduler;

pub type MapCache = CachedMapLoader<Box<dyn MapLoader>>;

const NUDGE_POLLS: usize = 50;
const NUDGE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    Arrived,
    /// The pathfinder found no route; nothing was sent
    NoPath,
    /// A waypoint was not reached in time
    TimedOut,
    /// The map changed or the entity was stopped
    Cancelled,
    /// The initiating periodic condition is already walking or cooling down
    Skipped,
}

impl WalkOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, WalkOutcome::Arrived)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalkParams {
    pub target: Position,
    /// Walk to a random point this far from `target` when reachable
    pub radius: i32,
    pub with_companion: bool,
    /// Path nodes between waypoints
    pub stride: usize,
    pub timeout: Duration,
    pub proximity: f64,
}

impl WalkParams {
    pub fn new(target: Position, config: &WalkConfig) -> Self {
        Self {
            target,
            radius: 0,
            with_companion: true,
            stride: config.stride,
            timeout: config.waypoint_timeout(),
            proximity: config.proximity,
        }
    }
}

enum Progress {
    Arrived,
    TimedOut,
    MapChanged,
    Stopped,
}

enum GuardState {
    Walking,
    Finished(Instant),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a periodic condition as walking until dropped
struct WalkGuard<'a> {
    guards: &'a Mutex<HashMap<ConditionId, GuardState>>,
    id: ConditionId,
}

impl Drop for WalkGuard<'_> {
    fn drop(&mut self) {
        lock(self.guards).insert(self.id, GuardState::Finished(Instant::now()));
    }
}

/// Collaborators the walk coordinator drives
pub struct WalkDeps {
    pub api: Arc<dyn GameApi>,
    pub state: SharedState,
    pub pathfinder: Arc<dyn Pathfinder>,
    pub maps: Arc<MapCache>,
}

pub struct WalkCoordinator {
    config: WalkConfig,
    state: SharedState,
    pathfinder: Arc<dyn Pathfinder>,
    maps: Arc<MapCache>,
    path_pool: BlockingPool,
    queue_tx: mpsc::UnboundedSender<(u64, WalkRequest)>,
    generation: Arc<AtomicU64>,
    guards: Mutex<HashMap<ConditionId, GuardState>>,
    stop_rx: watch::Receiver<bool>,
}

impl WalkCoordinator {
    /// Create the coordinator and spawn its queue worker on the scheduler's runtime
    pub fn new(
        config: WalkConfig,
        deps: WalkDeps,
        path_pool: BlockingPool,
        scheduler: &Scheduler,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(0));
        let stop_rx = scheduler.stop_signal();
        scheduler.runtime().spawn(run_walk_worker(
            queue_rx,
            deps.api,
            Arc::clone(&generation),
            stop_rx.clone(),
        ));

        Self {
            config,
            state: deps.state,
            pathfinder: deps.pathfinder,
            maps: deps.maps,
            path_pool,
            queue_tx,
            generation,
            guards: Mutex::new(HashMap::new()),
            stop_rx,
        }
    }

    pub fn config(&self) -> &WalkConfig {
        &self.config
    }

    fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    fn claim(&self, id: ConditionId) -> Option<WalkGuard<'_>> {
        let mut guards = lock(&self.guards);
        match guards.get(&id) {
            Some(GuardState::Walking) => return None,
            Some(GuardState::Finished(at)) if at.elapsed() < self.config.periodic_cooldown() => {
                return None
            }
            _ => {}
        }
        guards.insert(id, GuardState::Walking);
        Some(WalkGuard {
            guards: &self.guards,
            id,
        })
    }

    /// Walk to `params.target`.
    ///
    /// `initiator` is the periodic condition asking, if any; it may not start
    /// another walk while walking or within the cooldown after finishing.
    pub async fn walk_to(&self, initiator: Option<ConditionId>, params: WalkParams) -> WalkOutcome {
        let _guard = match initiator {
            Some(id) => match self.claim(id) {
                Some(guard) => Some(guard),
                None => {
                    debug!(target: "walk", "Condition {} is walking or cooling down, skipping", id);
                    return WalkOutcome::Skipped;
                }
            },
            None => None,
        };

        let epoch = self.state.map_epoch();
        let Some(path) = self.plan(params.target, params.radius).await else {
            info!(
                target: "walk",
                "Failed to find a path to ({}, {})",
                params.target.x,
                params.target.y
            );
            return WalkOutcome::NoPath;
        };

        let proximity = params.proximity;
        for waypoint in waypoints(&path, params.stride) {
            let progress = self
                .drive_to(waypoint, params.with_companion, params.timeout, epoch, |pos| {
                    pos.distance(waypoint) <= proximity
                })
                .await;
            match progress {
                Progress::Arrived => {}
                Progress::TimedOut => {
                    info!(
                        target: "walk",
                        "Timed out reaching ({}, {})",
                        waypoint.x,
                        waypoint.y
                    );
                    return WalkOutcome::TimedOut;
                }
                Progress::MapChanged | Progress::Stopped => return WalkOutcome::Cancelled,
            }
        }
        WalkOutcome::Arrived
    }

    /// Walk towards `target`, then nudge around the last node until the map
    /// changes. Returns whether it did before the timeout.
    pub async fn walk_and_await_map_change(&self, target: Position, with_companion: bool) -> bool {
        let epoch = self.state.map_epoch();
        let Some(path) = self.plan(target, 0).await else {
            info!(target: "walk", "Failed to find a path to ({}, {})", target.x, target.y);
            return false;
        };

        let stride = self.config.map_change_stride.max(1);
        let timeout = self.config.waypoint_timeout();
        for &waypoint in path.iter().skip(stride).step_by(stride) {
            let progress = self
                .drive_to(waypoint, with_companion, timeout, epoch, |pos| {
                    (pos.x - waypoint.x).abs() <= 1 && (pos.y - waypoint.y).abs() <= 1
                })
                .await;
            match progress {
                Progress::Arrived | Progress::TimedOut => {}
                Progress::MapChanged => return true,
                Progress::Stopped => return false,
            }
        }

        let Some(&last) = path.last() else {
            return false;
        };
        let deadline = Instant::now() + self.config.map_change_timeout();
        while Instant::now() < deadline {
            if self.is_stopped() {
                return false;
            }
            if self.state.map_epoch() != epoch {
                return true;
            }

            let nudge = {
                let mut rng = rand::thread_rng();
                Position::new(last.x + rng.gen_range(-1..=1), last.y + rng.gen_range(-1..=1))
            };
            self.submit(nudge, with_companion);

            for _ in 0..NUDGE_POLLS {
                if self.state.map_epoch() != epoch {
                    return true;
                }
                if self.is_stopped() || Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(NUDGE_POLL).await;
            }
        }

        let changed = self.state.map_epoch() != epoch;
        if !changed {
            info!(target: "walk", "Map did not change near ({}, {})", last.x, last.y);
        }
        changed
    }

    /// Drop queued requests and forget walk cooldowns
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.guards).clear();
    }

    async fn plan(&self, target: Position, radius: i32) -> Option<Vec<Position>> {
        let (from, map_id) = self.state.read(|s| (s.position(), s.map_id));
        let candidate = if radius > 0 {
            let mut rng = rand::thread_rng();
            Position::new(
                target.x + rng.gen_range(-radius..=radius),
                target.y + rng.gen_range(-radius..=radius),
            )
        } else {
            target
        };

        let pathfinder = Arc::clone(&self.pathfinder);
        let maps = Arc::clone(&self.maps);
        let started = Instant::now();
        let path = self
            .path_pool
            .run(move || {
                let grid = match maps.load(map_id) {
                    Ok(grid) => grid,
                    Err(e) => {
                        warn!(target: "walk", "Cannot load map {}: {}", map_id, e);
                        return Vec::new();
                    }
                };
                let path = pathfinder.find_path(from, candidate, &grid);
                if path.is_empty() && candidate != target {
                    // Offset point unreachable, fall back to the exact target
                    pathfinder.find_path(from, target, &grid)
                } else {
                    path
                }
            })
            .await?;

        if path.is_empty() {
            return None;
        }
        debug!(
            target: "walk",
            "Path of {} node(s) found in {:?}",
            path.len(),
            started.elapsed()
        );
        Some(path)
    }

    async fn drive_to(
        &self,
        waypoint: Position,
        with_companion: bool,
        timeout: Duration,
        epoch: u64,
        arrived: impl Fn(Position) -> bool,
    ) -> Progress {
        let resend = self.config.resend_interval(timeout);
        let poll = self.config.poll_interval();
        let started = Instant::now();
        let mut last_sent = started;
        self.submit(waypoint, with_companion);

        loop {
            if self.is_stopped() {
                return Progress::Stopped;
            }
            if self.state.map_epoch() != epoch {
                return Progress::MapChanged;
            }
            if arrived(self.state.position()) {
                return Progress::Arrived;
            }
            let now = Instant::now();
            if now.duration_since(started) >= timeout {
                return Progress::TimedOut;
            }
            if now.duration_since(last_sent) >= resend {
                self.submit(waypoint, with_companion);
                last_sent = now;
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn submit(&self, to: Position, with_companion: bool) {
        let generation = self.generation.load(Ordering::SeqCst);
        let request = WalkRequest::new(to.x, to.y, with_companion);
        if self.queue_tx.send((generation, request)).is_err() {
            warn!(target: "walk", "Walk worker has stopped, dropping request");
        }
    }
}

/// Every `stride`-th node starting with the first, always ending on the last
fn waypoints(path: &[Position], stride: usize) -> Vec<Position> {
    let mut points: Vec<Position> = path.iter().step_by(stride.max(1)).copied().collect();
    if let Some(&last) = path.last() {
        if points.last() != Some(&last) {
            points.push(last);
        }
    }
    points
}

async fn run_walk_worker(
    mut queue_rx: mpsc::UnboundedReceiver<(u64, WalkRequest)>,
    api: Arc<dyn GameApi>,
    generation: Arc<AtomicU64>,
    stop_rx: watch::Receiver<bool>,
) {
    while let Some((queued_in, request)) = queue_rx.recv().await {
        if queued_in != generation.load(Ordering::SeqCst) || *stop_rx.borrow() {
            continue;
        }
        trace!(target: "walk", ?request, "Sending walk request");
        if let Err(e) = api.player_walk(request.x, request.y) {
            warn!(target: "walk", "player_walk failed: {}", e);
            continue;
        }
        if request.with_companion {
            if let Err(e) = api.pets_walk(request.x, request.y) {
                warn!(target: "walk", "pets_walk failed: {}", e);
            }
        }
    }
    debug!(target: "walk", "Walk worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use marionette_client::{
        ApiError, EntityState, GridPathfinder, MapGrid, MapError, OpenMapLoader,
    };
    use marionette_events::{ClientAction, ConditionKind, QueryKind};
    use tokio::runtime::Handle;

    /// Records actions; optionally teleports the player to walk targets
    struct FakeClient {
        state: SharedState,
        actions: Mutex<Vec<ClientAction>>,
        teleport: bool,
        change_map_on_walk: bool,
    }

    impl FakeClient {
        fn walks(&self) -> Vec<ClientAction> {
            self.actions.lock().unwrap().clone()
        }
    }

    impl GameApi for FakeClient {
        fn send_packet(&self, _packet: &str) -> Result<(), ApiError> {
            Ok(())
        }

        fn recv_packet(&self, _packet: &str) -> Result<(), ApiError> {
            Ok(())
        }

        fn player_walk(&self, x: i32, y: i32) -> Result<(), ApiError> {
            self.actions
                .lock()
                .unwrap()
                .push(ClientAction::PlayerWalk { x, y });
            if self.teleport {
                self.state.update(|s| {
                    s.x = x;
                    s.y = y;
                });
            }
            if self.change_map_on_walk {
                self.state.update(|s| s.map_epoch += 1);
            }
            Ok(())
        }

        fn pets_walk(&self, x: i32, y: i32) -> Result<(), ApiError> {
            self.actions
                .lock()
                .unwrap()
                .push(ClientAction::PetsWalk { x, y });
            Ok(())
        }

        fn query(&self, _kind: QueryKind) -> Result<(), ApiError> {
            Ok(())
        }
    }

    struct WalledMap;

    impl MapLoader for WalledMap {
        fn load_map(&self, map_id: i32) -> Result<MapGrid, MapError> {
            let mut grid = MapGrid::open(map_id, 20, 20);
            for y in 0..20 {
                grid.set_walkable(Position::new(10, y), false);
            }
            Ok(grid)
        }
    }

    struct Fixture {
        scheduler: Scheduler,
        client: Arc<FakeClient>,
        state: SharedState,
        walker: WalkCoordinator,
    }

    fn fixture(teleport: bool, change_map_on_walk: bool, map: Box<dyn MapLoader>) -> Fixture {
        let scheduler = Scheduler::new(Handle::current());
        scheduler.set_stopped(false);
        let state = SharedState::new(EntityState::default());
        let client = Arc::new(FakeClient {
            state: state.clone(),
            actions: Mutex::new(Vec::new()),
            teleport,
            change_map_on_walk,
        });
        let walker = WalkCoordinator::new(
            WalkConfig::default(),
            WalkDeps {
                api: client.clone(),
                state: state.clone(),
                pathfinder: Arc::new(GridPathfinder),
                maps: Arc::new(CachedMapLoader::new(map)),
            },
            BlockingPool::new("path", 1),
            &scheduler,
        );
        Fixture {
            scheduler,
            client,
            state,
            walker,
        }
    }

    fn open_map() -> Box<dyn MapLoader> {
        Box::new(OpenMapLoader {
            width: 40,
            height: 40,
        })
    }

    fn params(x: i32, y: i32) -> WalkParams {
        WalkParams::new(Position::new(x, y), &WalkConfig::default())
    }

    #[test]
    fn test_waypoints_end_on_last_node() {
        let path: Vec<Position> = (1..=10).map(|x| Position::new(x, 0)).collect();
        let xs: Vec<i32> = waypoints(&path, 4).iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![1, 5, 9, 10]);

        let xs: Vec<i32> = waypoints(&path[..9], 4).iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![1, 5, 9]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_walk_arrives_in_strides() {
        let f = fixture(true, false, open_map());

        let outcome = f.walker.walk_to(None, params(10, 0)).await;
        assert_eq!(outcome, WalkOutcome::Arrived);
        // The final node is within proximity before its request is drained
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.state.position(), Position::new(10, 0));
        assert_eq!(
            f.client.walks(),
            [1, 5, 9, 10]
                .into_iter()
                .flat_map(|x| [
                    ClientAction::PlayerWalk { x, y: 0 },
                    ClientAction::PetsWalk { x, y: 0 }
                ])
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_path_sends_nothing() {
        let f = fixture(true, false, Box::new(WalledMap));

        let outcome = f.walker.walk_to(None, params(15, 5)).await;
        assert_eq!(outcome, WalkOutcome::NoPath);
        assert!(!outcome.is_success());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(f.client.walks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreached_waypoint_times_out_with_resends() {
        let f = fixture(false, false, open_map());
        let mut walk = params(3, 0);
        walk.with_companion = false;

        let started = Instant::now();
        let outcome = f.walker.walk_to(None, walk).await;
        assert_eq!(outcome, WalkOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(3));

        // Initial request plus one resend per second
        let walks = f.client.walks();
        assert_eq!(walks.len(), 3);
        assert!(walks
            .iter()
            .all(|a| *a == ClientAction::PlayerWalk { x: 1, y: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_map_change_cancels_walk() {
        let f = fixture(false, true, open_map());
        let outcome = f.walker.walk_to(None, params(12, 0)).await;
        assert_eq!(outcome, WalkOutcome::Cancelled);
        assert_eq!(f.client.walks().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_walk_and_drops_requests() {
        let f = fixture(false, false, open_map());
        f.scheduler.set_stopped(true);

        let outcome = f.walker.walk_to(None, params(5, 0)).await;
        assert_eq!(outcome, WalkOutcome::Cancelled);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.client.walks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_walk_cooldown() {
        let f = fixture(true, false, open_map());
        let mut registry = crate::registry::ConditionRegistry::new();
        let id = registry.add(ConditionKind::Periodic, "p", "", true).unwrap();

        assert_eq!(f.walker.walk_to(Some(id), params(2, 0)).await, WalkOutcome::Arrived);
        assert_eq!(f.walker.walk_to(Some(id), params(4, 0)).await, WalkOutcome::Skipped);
        // Ad-hoc walks are not guarded
        assert_eq!(f.walker.walk_to(None, params(4, 0)).await, WalkOutcome::Arrived);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.walker.walk_to(Some(id), params(6, 0)).await, WalkOutcome::Arrived);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_walkers_never_interleave() {
        let f = Arc::new(fixture(true, false, open_map()));

        let a = {
            let f = Arc::clone(&f);
            tokio::spawn(async move {
                let mut walk = params(20, 0);
                walk.proximity = 40.0;
                f.walker.walk_to(None, walk).await
            })
        };
        let b = {
            let f = Arc::clone(&f);
            tokio::spawn(async move {
                let mut walk = params(0, 20);
                walk.proximity = 40.0;
                f.walker.walk_to(None, walk).await
            })
        };
        a.await.unwrap();
        b.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let walks = f.client.walks();
        assert!(!walks.is_empty());
        for pair in walks.chunks(2) {
            match pair {
                [ClientAction::PlayerWalk { x, y }, ClientAction::PetsWalk { x: px, y: py }] => {
                    assert_eq!((x, y), (px, py));
                }
                other => panic!("interleaved walk commands: {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_walk_and_await_map_change() {
        let f = fixture(true, false, open_map());
        let state = f.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            state.update(|s| s.map_epoch += 1);
        });

        assert!(
            f.walker
                .walk_and_await_map_change(Position::new(8, 0), true)
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_walk_and_await_map_change_times_out() {
        let f = fixture(true, false, open_map());
        let started = Instant::now();
        assert!(
            !f.walker
                .walk_and_await_map_change(Position::new(8, 0), false)
                .await
        );
        assert!(started.elapsed() >= Duration::from_secs(10));
    }
}
