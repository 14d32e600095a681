use std::sync::{Arc, Barrier};
use std::thread;

use cardgraph_engine::{EngineError, JobGuard, JobKind};
use cardgraph_harness::{TestNetwork, TestPeer};

#[test]
fn only_one_thread_wins_the_slot() {
    let guard = JobGuard::new();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let guard = guard.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let ticket = guard.try_start(JobKind::Import);
                let won = ticket.is_some();
                // Hold any ticket until every thread has tried.
                barrier.wait();
                won
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
    assert!(!guard.is_running(JobKind::Import));
}

#[test]
fn import_is_rejected_while_another_runs() -> Result<(), Box<dyn std::error::Error>> {
    let mut source = TestPeer::new("source")?;
    source.seed_collection("Spanish", &[("gato", "cat")])?;
    let document = source.engine.export_document()?;

    let mut net = TestNetwork::new()?;
    let first = net.add_peer("first")?;
    let second = net.add_peer("second")?;

    // The first peer starts an import; the second must wait for it.
    let held = net.job_guard().try_start(JobKind::Import).unwrap();
    assert!(net.peer(first).engine.job_guard().is_running(JobKind::Import));
    let result = net.peer_mut(second).engine.import_document(&document);
    assert!(matches!(
        result,
        Err(EngineError::ConcurrentJobRejected(JobKind::Import))
    ));
    assert!(net.peer(second).engine.list_cards(net.peer(second).view())?.is_empty());

    drop(held);
    net.peer_mut(second).engine.import_document(&document)?;
    assert_eq!(net.peer(first).engine.list_cards(net.peer(first).view())?.len(), 1);
    Ok(())
}

#[test]
fn different_job_kinds_do_not_block_each_other() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new("tester")?;
    let _held = peer.engine.job_guard().try_start(JobKind::Import).unwrap();
    peer.engine.normalize_tags()?;
    assert!(peer.engine.job_guard().is_running(JobKind::Import));
    Ok(())
}
