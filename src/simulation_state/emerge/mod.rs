//! # Emerge Module
//!
//! The asynchronous pipeline that produces blocks the simulation references
//! but does not have: worker threads take block positions off per-worker
//! channels, try the persistence backend first, fall back to the terrain
//! generator, and send the populated block back on a completion channel the
//! environment drains once per tick.
//!
//! Dispatch is round-robin with a per-worker in-flight cap; requests that
//! find every worker busy wait in a queue that is re-dispatched each tick.
//! A position is never in the pipeline twice. Workers never touch the
//! backend for writing, so an abandoned job can at worst waste the work of
//! generating a block nobody inserts.

pub mod mapgen;

use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::world_state::block::MapBlock;
use crate::world_state::content::ContentRegistry;
use crate::world_state::persistence::MapDatabase;
use crate::world_state::position::{blockpos_over_limit, BlockPos};

use mapgen::{MapGenerator, MapgenParams};

/// Per-worker in-flight cap; one keeps per-worker ordering trivial.
const MAX_TASKS_IN_FLIGHT: usize = 1;

struct EmergeTask {
    pos: BlockPos,
}

/// One completed emerge, delivered to the environment's ingestion pass.
pub enum EmergeReply {
    /// The block existed in the persistence backend.
    Loaded {
        /// Position of the block.
        pos: BlockPos,
        /// The deserialized block.
        block: MapBlock,
    },
    /// The block was generated fresh (or regenerated over corrupt data).
    Generated {
        /// Position of the block.
        pos: BlockPos,
        /// The generated block.
        block: MapBlock,
    },
    /// The position can never be emerged (outside the generation limit).
    Failed {
        /// Position of the rejected request.
        pos: BlockPos,
    },
}

impl EmergeReply {
    /// The position this reply is about.
    pub fn pos(&self) -> BlockPos {
        match self {
            EmergeReply::Loaded { pos, .. }
            | EmergeReply::Generated { pos, .. }
            | EmergeReply::Failed { pos } => *pos,
        }
    }
}

struct EmergeChannel {
    task_sender: Option<Sender<EmergeTask>>,
    reply_receiver: Receiver<EmergeReply>,
    tasks_in_flight: usize,
    worker: Option<JoinHandle<()>>,
}

fn emerge_one(
    pos: BlockPos,
    generator: &MapGenerator,
    registry: &ContentRegistry,
    database: Option<&dyn MapDatabase>,
) -> EmergeReply {
    if blockpos_over_limit(pos) {
        return EmergeReply::Failed { pos };
    }
    if let Some(db) = database {
        if let Some(data) = db.load_block(pos) {
            match MapBlock::deserialize(pos, &data) {
                Ok(block) => return EmergeReply::Loaded { pos, block },
                Err(e) => warn!("regenerating corrupt block {pos:?}: {e:#}"),
            }
        }
    }
    EmergeReply::Generated {
        pos,
        block: generator.generate(registry, pos),
    }
}

/// The emerge pipeline. See the module documentation.
pub struct EmergeManager {
    channels: Vec<EmergeChannel>,
    queued: VecDeque<EmergeTask>,
    in_flight: HashSet<BlockPos>,
    current_channel: usize,
}

impl EmergeManager {
    /// Starts `num_workers` worker threads over the given registry, backend
    /// and generator configuration.
    ///
    /// # Panics
    /// Panics if the underlying thread creation fails.
    pub fn new(
        num_workers: usize,
        registry: Arc<ContentRegistry>,
        database: Option<Arc<dyn MapDatabase>>,
        params: MapgenParams,
    ) -> Self {
        let num_workers = num_workers.max(1);
        let mut channels = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let (task_tx, task_rx) = channel::<EmergeTask>();
            let (reply_tx, reply_rx) = channel::<EmergeReply>();
            let registry = registry.clone();
            let database = database.clone();
            let worker = thread::Builder::new()
                .name(format!("emerge-{i}"))
                .spawn(move || {
                    let generator = MapGenerator::new(params);
                    while let Ok(task) = task_rx.recv() {
                        let reply =
                            emerge_one(task.pos, &generator, &registry, database.as_deref());
                        if reply_tx.send(reply).is_err() {
                            break;
                        }
                    }
                })
                .expect("spawning emerge worker");
            channels.push(EmergeChannel {
                task_sender: Some(task_tx),
                reply_receiver: reply_rx,
                tasks_in_flight: 0,
                worker: Some(worker),
            });
        }
        info!("emerge pipeline started with {num_workers} workers");
        Self {
            channels,
            queued: VecDeque::new(),
            in_flight: HashSet::new(),
            current_channel: 0,
        }
    }

    /// Number of requests somewhere in the pipeline.
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    fn find_available_channel(&self) -> Option<usize> {
        let n = self.channels.len();
        (0..n)
            .map(|offset| (self.current_channel + offset) % n)
            .find(|&i| self.channels[i].tasks_in_flight < MAX_TASKS_IN_FLIGHT)
    }

    fn dispatch(&mut self, task: EmergeTask) {
        let Some(idx) = self.find_available_channel() else {
            self.queued.push_back(task);
            return;
        };
        let channel = &mut self.channels[idx];
        let Some(sender) = channel.task_sender.as_ref() else {
            return;
        };
        match sender.send(task) {
            Ok(()) => {
                channel.tasks_in_flight += 1;
                self.current_channel = (idx + 1) % self.channels.len();
            }
            Err(e) => {
                warn!("emerge worker {idx} is gone; request requeued");
                self.queued.push_back(e.0);
            }
        }
    }

    /// Requests a block. Returns `false` when the position is outside the
    /// generation limit or already somewhere in the pipeline.
    pub fn request_block(&mut self, pos: BlockPos) -> bool {
        if blockpos_over_limit(pos) {
            warn!("emerge request for {pos:?} rejected: outside generation limit");
            return false;
        }
        if !self.in_flight.insert(pos) {
            return false;
        }
        self.dispatch(EmergeTask { pos });
        true
    }

    /// Re-dispatches queued requests onto workers that have freed up. Called
    /// once per tick.
    pub fn process_queued(&mut self) {
        while self.find_available_channel().is_some() {
            let Some(task) = self.queued.pop_front() else {
                break;
            };
            self.dispatch(task);
        }
    }

    /// Drains every completed emerge. Called once per tick by the
    /// environment.
    pub fn collect_replies(&mut self) -> Vec<EmergeReply> {
        let mut replies = Vec::new();
        for channel in &mut self.channels {
            while let Ok(reply) = channel.reply_receiver.try_recv() {
                channel.tasks_in_flight = channel.tasks_in_flight.saturating_sub(1);
                self.in_flight.remove(&reply.pos());
                replies.push(reply);
            }
        }
        replies
    }
}

impl Drop for EmergeManager {
    fn drop(&mut self) {
        // Dropping the senders ends the worker loops; unconsumed replies die
        // with the receivers and are never written anywhere.
        for channel in &mut self.channels {
            channel.task_sender = None;
        }
        for channel in &mut self.channels {
            if let Some(worker) = channel.worker.take() {
                let _ = worker.join();
            }
        }
        if !self.queued.is_empty() {
            debug!("discarded {} queued emerge requests at shutdown", self.queued.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world_state::node::CONTENT_IGNORE;
    use crate::world_state::persistence::MemoryDatabase;
    use cgmath::Point3;
    use std::time::Duration;

    fn params() -> MapgenParams {
        MapgenParams {
            seed: 7,
            water_level: 1,
        }
    }

    fn wait_for_replies(manager: &mut EmergeManager, count: usize) -> Vec<EmergeReply> {
        let mut replies = Vec::new();
        for _ in 0..500 {
            manager.process_queued();
            replies.extend(manager.collect_replies());
            if replies.len() >= count {
                return replies;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("emerge replies did not arrive: {}/{count}", replies.len());
    }

    #[test]
    fn missing_blocks_are_generated() {
        let registry = Arc::new(ContentRegistry::with_builtin());
        let mut manager = EmergeManager::new(1, registry, None, params());
        assert!(manager.request_block(Point3::new(0, 0, 0)));

        let replies = wait_for_replies(&mut manager, 1);
        match &replies[0] {
            EmergeReply::Generated { pos, block } => {
                assert_eq!(*pos, Point3::new(0, 0, 0));
                assert!(block.is_generated());
                // Terrain, not blanks.
                assert!(block.nodes().iter().all(|n| n.content != CONTENT_IGNORE));
            }
            _ => panic!("expected a generated block"),
        }
        assert_eq!(manager.pending(), 0);
    }

    #[test]
    fn persisted_blocks_are_loaded_not_generated() {
        let registry = Arc::new(ContentRegistry::with_builtin());
        let db = Arc::new(MemoryDatabase::new());
        let pos = Point3::new(2, 1, -3);
        let mut saved = MapBlock::new_blank(pos);
        saved.set_node_at(Point3::new(3, 3, 3), crate::world_state::node::MapNode::new(9));
        saved.set_generated();
        db.save_block(pos, &saved.serialize()).unwrap();

        let mut manager = EmergeManager::new(2, registry, Some(db), params());
        assert!(manager.request_block(pos));
        let replies = wait_for_replies(&mut manager, 1);
        match &replies[0] {
            EmergeReply::Loaded { block, .. } => {
                assert_eq!(block.node_at(Point3::new(3, 3, 3)).content, 9);
            }
            _ => panic!("expected a loaded block"),
        }
    }

    #[test]
    fn corrupt_persisted_blocks_are_regenerated() {
        let registry = Arc::new(ContentRegistry::with_builtin());
        let db = Arc::new(MemoryDatabase::new());
        let pos = Point3::new(1, 1, 1);
        db.save_block(pos, b"garbage").unwrap();

        let mut manager = EmergeManager::new(1, registry, Some(db), params());
        assert!(manager.request_block(pos));
        let replies = wait_for_replies(&mut manager, 1);
        assert!(matches!(replies[0], EmergeReply::Generated { .. }));
    }

    #[test]
    fn duplicate_and_over_limit_requests_are_rejected() {
        let registry = Arc::new(ContentRegistry::with_builtin());
        let mut manager = EmergeManager::new(1, registry, None, params());

        assert!(!manager.request_block(Point3::new(5000, 0, 0)));
        assert!(manager.request_block(Point3::new(1, 0, 0)));
        assert!(!manager.request_block(Point3::new(1, 0, 0)), "already in flight");

        let replies = wait_for_replies(&mut manager, 1);
        assert_eq!(replies.len(), 1);
        // Once completed, the position may be requested again.
        assert!(manager.request_block(Point3::new(1, 0, 0)));
        wait_for_replies(&mut manager, 1);
    }

    #[test]
    fn overflow_requests_queue_and_complete() {
        let registry = Arc::new(ContentRegistry::with_builtin());
        let mut manager = EmergeManager::new(2, registry, None, params());
        let mut requested = 0;
        for x in 0..8 {
            if manager.request_block(Point3::new(x, 2, 0)) {
                requested += 1;
            }
        }
        assert_eq!(requested, 8);
        let replies = wait_for_replies(&mut manager, 8);
        assert_eq!(replies.len(), 8);
        assert_eq!(manager.pending(), 0);
    }
}
