use cardgraph_core::{ChangeNotification, FieldValue, model::fields};
use cardgraph_harness::TestNetwork;
use cardgraph_storage::Storage;

// ============================================================================
// Change notifications between engines sharing one store
// ============================================================================

#[test]
fn notification_reports_foreign_commits() -> Result<(), Box<dyn std::error::Error>> {
    let mut net = TestNetwork::new()?;
    let writer = net.add_peer("writer")?;
    let reader = net.add_peer("reader")?;

    let (collection, cards) = net
        .peer_mut(writer)
        .seed_collection("Spanish", &[("gato", "cat"), ("perro", "dog")])?;
    let events = net.broadcast_from(writer)?;
    assert_eq!(events.len(), 1);

    let event = events[0].clone().unwrap();
    assert!(event.external);
    assert_eq!(event.author, "writer");
    assert!(event.changed.contains(&collection));
    assert!(cards.iter().all(|card| event.changed.contains(card)));
    assert!(event.deleted.is_empty());

    let reader_peer = net.peer(reader);
    assert_eq!(reader_peer.engine.last_cursor()?, Some(event.cursor.clone()));
    assert_eq!(
        reader_peer
            .engine
            .cards_in_collection(reader_peer.view(), collection)?
            .len(),
        2
    );
    Ok(())
}

#[test]
fn repeated_notification_is_ignored() -> Result<(), Box<dyn std::error::Error>> {
    let mut net = TestNetwork::new()?;
    let writer = net.add_peer("writer")?;
    let reader = net.add_peer("reader")?;
    net.peer_mut(writer).seed_collection("Spanish", &[("gato", "cat")])?;

    let first = net.broadcast_from(writer)?;
    assert!(first[0].is_some());
    let second = net.broadcast_from(writer)?;
    assert!(second[0].is_none());

    let notification = net.peer(writer).engine.change_notification()?.unwrap();
    let again = net
        .peer_mut(reader)
        .engine
        .handle_change_notification(&notification)?;
    assert!(again.is_none());
    Ok(())
}

#[test]
fn subscriber_hears_external_changes() -> Result<(), Box<dyn std::error::Error>> {
    let mut net = TestNetwork::new()?;
    let writer = net.add_peer("writer")?;
    let reader = net.add_peer("reader")?;
    let events = net.peer_mut(reader).engine.subscribe();

    net.peer_mut(writer).seed_collection("Spanish", &[("gato", "cat")])?;
    net.broadcast_from(writer)?;

    let event = events.try_recv()?;
    assert!(event.external);
    assert!(events.try_recv().is_err());
    Ok(())
}

#[test]
fn foreign_delete_drops_local_pending_edits() -> Result<(), Box<dyn std::error::Error>> {
    let mut net = TestNetwork::new()?;
    let writer = net.add_peer("writer")?;
    let reader = net.add_peer("reader")?;
    let (_, cards) = net
        .peer_mut(writer)
        .seed_collection("Spanish", &[("gato", "cat"), ("perro", "dog")])?;
    net.broadcast_from(writer)?;

    // The reader starts editing the first card.
    {
        let peer = net.peer_mut(reader);
        let view = peer.view();
        peer.engine.set_field(
            view,
            cards[0],
            fields::NOTE,
            FieldValue::Text("draft".into()),
        )?;
        assert!(peer.engine.has_pending(view)?);
    }

    // Meanwhile the writer deletes it.
    {
        let peer = net.peer_mut(writer);
        let view = peer.view();
        peer.engine.delete_entity(view, cards[0])?;
        peer.engine.commit(view)?;
    }

    let events = net.broadcast_from(writer)?;
    let event = events[0].clone().unwrap();
    assert!(event.deleted.contains(&cards[0]));

    let peer = net.peer_mut(reader);
    let view = peer.view();
    assert!(!peer.engine.has_pending(view)?);
    assert!(peer.engine.resolve(view, cards[0])?.is_none());
    assert!(peer.engine.resolve(view, cards[1])?.is_some());

    // Nothing stale is left to commit.
    assert!(peer.engine.commit(view)?.is_noop());
    Ok(())
}

#[test]
fn unreadable_notification_changes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let mut net = TestNetwork::new()?;
    let reader = net.add_peer("reader")?;
    let garbage = ChangeNotification::from_payload(vec![0xc1, 0x00, 0x07]);

    let event = net
        .peer_mut(reader)
        .engine
        .handle_change_notification(&garbage)?;
    assert!(event.is_none());
    assert!(net.peer(reader).engine.last_cursor()?.is_none());
    Ok(())
}

#[test]
fn handling_a_notification_prunes_old_history() -> Result<(), Box<dyn std::error::Error>> {
    let mut net = TestNetwork::new()?;
    let writer = net.add_peer("writer")?;
    let reader = net.add_peer("reader")?;
    let (_, cards) = net
        .peer_mut(writer)
        .seed_collection("Spanish", &[("gato", "cat"), ("perro", "dog")])?;
    net.peer_mut(writer).relate(cards[0], cards[1])?;
    net.peer_mut(writer).tag_cards("animals", &cards)?;
    assert_eq!(net.peer(reader).engine.storage().history_after(None)?.len(), 3);

    net.broadcast_from(writer)?;
    let remaining = net.peer(reader).engine.storage().history_after(None)?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(Some(remaining[0].cursor.clone()), net.peer(reader).engine.last_cursor()?);
    Ok(())
}
