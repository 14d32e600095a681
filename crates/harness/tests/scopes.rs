use cardgraph_core::{FieldValue, model::fields};
use cardgraph_engine::{CommitPolicy, EngineError, ScopeKind};
use cardgraph_harness::TestPeer;

// ============================================================================
// Isolation
// ============================================================================

#[test]
fn child_edits_are_invisible_to_parent_and_siblings() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new("tester")?;
    let (collection, cards) = peer.seed_collection("Spanish", &[("gato", "cat")])?;
    let view = peer.view();

    let editor = peer.engine.new_child_scope(Some(view), ScopeKind::Edit)?;
    let sibling = peer.engine.new_child_scope(Some(view), ScopeKind::Edit)?;
    let draft = peer.engine.create_card(editor, collection, "perro", "dog")?;
    peer.engine.set_field(
        editor,
        cards[0],
        fields::NOTE,
        FieldValue::Text("feline".into()),
    )?;

    assert_eq!(peer.engine.cards_in_collection(editor, collection)?.len(), 2);
    assert_eq!(peer.engine.card(editor, cards[0])?.note, "feline");

    for other in [view, sibling] {
        assert!(peer.engine.resolve(other, draft)?.is_none());
        assert_eq!(peer.engine.card(other, cards[0])?.note, "");
    }
    Ok(())
}

#[test]
fn committing_a_child_writes_its_ancestors_too() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new("tester")?;
    let view = peer.view();
    let collection = peer.engine.create_collection(view, "Spanish")?;
    let editor = peer.engine.new_child_scope(Some(view), ScopeKind::Edit)?;
    let card = peer.engine.create_card(editor, collection, "gato", "cat")?;

    let outcome = peer.engine.commit(editor)?;
    assert!(outcome.cursor.is_some());
    assert!(!peer.engine.has_pending(view)?);
    assert!(!peer.engine.has_pending(editor)?);

    // Durable now, so a brand new root scope sees it.
    let fresh = peer.engine.new_child_scope(None, ScopeKind::Edit)?;
    assert_eq!(peer.engine.card(fresh, card)?.collection, Some(collection));
    Ok(())
}

#[test]
fn discard_only_touches_one_scope() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new("tester")?;
    let view = peer.view();
    let collection = peer.engine.create_collection(view, "Spanish")?;
    let editor = peer.engine.new_child_scope(Some(view), ScopeKind::Edit)?;
    let card = peer.engine.create_card(editor, collection, "gato", "cat")?;

    peer.engine.discard(editor)?;
    assert!(peer.engine.resolve(editor, card)?.is_none());
    assert!(peer.engine.resolve(editor, collection)?.is_some());
    assert!(peer.engine.has_pending(view)?);
    Ok(())
}

#[test]
fn closing_a_scope_closes_its_children() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new("tester")?;
    let view = peer.view();
    let outer = peer.engine.new_child_scope(Some(view), ScopeKind::Edit)?;
    let inner = peer.engine.new_child_scope(Some(outer), ScopeKind::Edit)?;

    peer.engine.close_scope(outer)?;
    assert!(matches!(peer.engine.scope(outer), Err(EngineError::ScopeNotFound(_))));
    assert!(matches!(peer.engine.scope(inner), Err(EngineError::ScopeNotFound(_))));
    assert!(peer.engine.scope(view).is_ok());
    Ok(())
}

// ============================================================================
// Commit failures
// ============================================================================

#[test]
fn failed_write_keeps_pending_changes() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new("tester")?;
    let view = peer.view();
    let collection = peer.engine.create_collection(view, "Spanish")?;
    peer.engine.create_card(view, collection, "gato", "cat")?;

    peer.engine
        .storage()
        .conn()
        .execute_batch("PRAGMA query_only = ON")?;
    let result = peer.engine.commit(view);
    assert!(matches!(result, Err(EngineError::CommitFailure(_))));
    assert!(peer.engine.has_pending(view)?);

    peer.engine
        .storage()
        .conn()
        .execute_batch("PRAGMA query_only = OFF")?;
    peer.engine.commit(view)?;
    assert!(!peer.engine.has_pending(view)?);
    assert_eq!(peer.engine.list_cards(view)?.len(), 1);
    Ok(())
}

#[test]
fn rejected_entities_stay_pending_for_correction() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new("tester")?;
    let view = peer.view();
    let collection = peer.engine.create_collection(view, "Spanish")?;
    let good = peer.engine.create_card(view, collection, "gato", "cat")?;
    let bad = peer.engine.create_card(view, collection, "perro", "   ")?;

    let outcome = peer.engine.commit_with(view, CommitPolicy::RejectInvalid)?;
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].entity_id, bad);
    assert!(peer.engine.has_pending(view)?);

    peer.engine.set_field(
        view,
        bad,
        fields::TRANSLATION,
        FieldValue::Text("dog".into()),
    )?;
    peer.engine.commit(view)?;
    let natives: Vec<String> = peer
        .engine
        .list_cards(view)?
        .into_iter()
        .map(|card| card.native)
        .collect();
    assert_eq!(natives.len(), 2);
    assert!(peer.engine.resolve(view, good)?.is_some());
    Ok(())
}

// ============================================================================
// Cascades
// ============================================================================

#[test]
fn deleted_card_leaves_every_relationship_set() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new("tester")?;
    let (_, cards) = peer.seed_collection(
        "Spanish",
        &[("gato", "cat"), ("perro", "dog"), ("pez", "fish")],
    )?;
    let tag = peer.tag_cards("animals", &cards)?;
    peer.relate(cards[0], cards[1])?;
    peer.relate(cards[0], cards[2])?;
    peer.relate(cards[1], cards[2])?;

    let view = peer.view();
    peer.engine.delete_entity(view, cards[0])?;
    peer.engine.commit(view)?;

    assert!(!peer.related(cards[1])?.contains(&cards[0]));
    assert!(!peer.related(cards[2])?.contains(&cards[0]));
    assert!(peer.related(cards[1])?.contains(&cards[2]));
    assert_eq!(peer.engine.cards_with_tag(view, tag)?.len(), 2);
    assert_eq!(peer.tag_names()?, vec!["animals".to_string()]);
    Ok(())
}

#[test]
fn deleting_a_collection_keeps_shared_tags() -> Result<(), Box<dyn std::error::Error>> {
    let mut peer = TestPeer::new("tester")?;
    let (spanish, spanish_cards) = peer.seed_collection("Spanish", &[("gato", "cat")])?;
    let (_, french_cards) = peer.seed_collection("French", &[("chat", "cat")])?;
    let tag = peer.tag_cards("animals", &[spanish_cards[0], french_cards[0]])?;
    peer.relate(spanish_cards[0], french_cards[0])?;

    let view = peer.view();
    peer.engine.delete_entity(view, spanish)?;
    peer.engine.commit(view)?;

    assert!(peer.engine.resolve(view, spanish_cards[0])?.is_none());
    assert!(peer.related(french_cards[0])?.is_empty());
    assert_eq!(
        peer.engine.cards_with_tag(view, tag)?.into_iter().collect::<Vec<_>>(),
        vec![french_cards[0]]
    );
    Ok(())
}
