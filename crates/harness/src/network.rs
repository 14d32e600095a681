use std::path::{Path, PathBuf};

use tempfile::TempDir;

use cardgraph_engine::{ContentChanged, EngineError, JobGuard};

use crate::TestPeer;

/// Several engines sharing one on-disk database, with change signals delivered by hand.
/// Peers also share single-flight job state, as engines in one process would.
pub struct TestNetwork {
    _dir: TempDir,
    db_path: PathBuf,
    jobs: JobGuard,
    peers: Vec<TestPeer>,
}

impl TestNetwork {
    pub fn new() -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("cardgraph.db");
        Ok(Self {
            _dir: dir,
            db_path,
            jobs: JobGuard::new(),
            peers: Vec::new(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn job_guard(&self) -> &JobGuard {
        &self.jobs
    }

    pub fn add_peer(&mut self, author: &str) -> Result<usize, EngineError> {
        let peer = TestPeer::open(&self.db_path, author)?.with_job_guard(self.jobs.clone());
        let index = self.peers.len();
        self.peers.push(peer);
        Ok(index)
    }

    pub fn peer(&self, index: usize) -> &TestPeer {
        &self.peers[index]
    }

    pub fn peer_mut(&mut self, index: usize) -> &mut TestPeer {
        &mut self.peers[index]
    }

    /// Deliver the newest change signal of peer `from` to every other peer.
    pub fn broadcast_from(
        &mut self,
        from: usize,
    ) -> Result<Vec<Option<ContentChanged>>, EngineError> {
        let Some(notification) = self.peers[from].engine.change_notification()? else {
            return Ok(Vec::new());
        };
        let mut events = Vec::new();
        for (index, peer) in self.peers.iter_mut().enumerate() {
            if index != from {
                events.push(peer.engine.handle_change_notification(&notification)?);
            }
        }
        Ok(events)
    }
}
