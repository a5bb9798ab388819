//! Three-way merge pipeline tests against the scripted model client.
//!
//! The scripts follow the pipeline's call order exactly: one summary per
//! history (base, then left/current, then right/target), then the final
//! merge completion.
mod common;

use common::{service_with, state, state_json, ScriptedResponse};
use forky::{ConflictKind, ConversationService, ForkyError, NodeId, StateRecord};
use futures::StreamExt;

async fn chat(service: &ConversationService, id: &str, message: &str) {
    let mut stream = service.chat(id, message, "scripted-small", vec![]).await.unwrap();
    while stream.next().await.is_some() {}
}

/// Build the S4/S5 shape: two branches diverging from an LCA.
///
/// Returns `(conversation, lca, tip_b1, tip_b2)`; the checkout is left on
/// `tip_b2`, which therefore becomes the merge's left parent.
async fn diverged(service: &ConversationService) -> (String, NodeId, NodeId, NodeId) {
    let id = service.create_conversation(Some("merge-me".into())).await.unwrap();
    chat(service, &id, "shared context").await;
    let lca = service.get_history(&id).await.unwrap().last().unwrap().id.clone();

    chat(service, &id, "explore y").await;
    let tip_b1 = service.get_history(&id).await.unwrap().last().unwrap().id.clone();

    service.checkout(&id, &lca).await.unwrap();
    service.fork(&id, Some("alt".into())).await.unwrap();
    chat(service, &id, "explore z").await;
    let tip_b2 = service.get_history(&id).await.unwrap().last().unwrap().id.clone();

    (id, lca, tip_b1, tip_b2)
}

/// The chat responses consumed while building the diverged shape.
fn setup_script() -> Vec<ScriptedResponse> {
    vec![
        ScriptedResponse::Text("the baseline".into()),
        ScriptedResponse::Text("y=2 established".into()),
        ScriptedResponse::Text("z=3 established".into()),
    ]
}

#[tokio::test]
async fn test_three_way_merge_without_conflicts() {
    // S4: disjoint additions on both sides merge cleanly.
    let mut script = setup_script();
    script.extend([
        ScriptedResponse::Text(state_json(&state(&["x=1"], &[], "baseline"))),
        ScriptedResponse::Text(state_json(&state(&["x=1", "z=3"], &[], "left"))),
        ScriptedResponse::Text(state_json(&state(&["x=1", "y=2"], &[], "right"))),
        ScriptedResponse::Text("both branches agree; x=1, y=2, z=3".into()),
    ]);
    let (_dir, model, service) = service_with(script).await;

    let (id, lca, tip_b1, tip_b2) = diverged(&service).await;
    let outcome = service
        .merge_branches(&id, &tip_b1, "bring the branches together")
        .await
        .unwrap();

    assert!(!outcome.has_conflicts);
    assert!(outcome.conflicts.is_empty());

    let view = service.get_graph(&id).await.unwrap();
    assert_eq!(view.current_node_id, outcome.new_node_id);
    let merge_view = view.nodes.iter().find(|n| n.id == outcome.new_node_id).unwrap();
    let mut parents = merge_view.parent_ids.clone();
    parents.sort();
    let mut expected = vec![tip_b1.clone(), tip_b2.clone()];
    expected.sort();
    assert_eq!(parents, expected);

    let history = service.get_history(&id).await.unwrap();
    let merge_node = history.last().unwrap();
    let metadata = merge_node.merge_metadata.as_ref().unwrap();
    assert_eq!(metadata.lca_id, lca);
    assert_eq!(metadata.left_parent_id, tip_b2);
    assert_eq!(metadata.right_parent_id, tip_b1);
    assert!(metadata.conflicts.is_empty());
    assert_eq!(merge_node.content, "both branches agree; x=1, y=2, z=3");

    // The merge prompt carried both diffs and the user instruction.
    let prompts = model.prompts.lock().unwrap();
    let final_prompt = prompts.last().unwrap()[1].content().to_string();
    assert!(final_prompt.contains("z=3"));
    assert!(final_prompt.contains("y=2"));
    assert!(final_prompt.contains("bring the branches together"));
    assert!(final_prompt.contains("No conflicts were detected"));
}

#[tokio::test]
async fn test_merge_history_extends_left_parent() {
    // history(merge) == history(left parent) ++ [merge].
    let mut script = setup_script();
    script.extend([
        ScriptedResponse::Text(state_json(&state(&["x=1"], &[], "baseline"))),
        ScriptedResponse::Text(state_json(&state(&["x=1", "z=3"], &[], "left"))),
        ScriptedResponse::Text(state_json(&state(&["x=1", "y=2"], &[], "right"))),
        ScriptedResponse::Text("merged".into()),
    ]);
    let (_dir, _model, service) = service_with(script).await;

    let (id, _lca, tip_b1, tip_b2) = diverged(&service).await;
    let left_history: Vec<NodeId> = service
        .get_history(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(left_history.last(), Some(&tip_b2));

    let outcome = service.merge_branches(&id, &tip_b1, "").await.unwrap();
    let merged_history: Vec<NodeId> = service
        .get_history(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();

    let mut expected = left_history;
    expected.push(outcome.new_node_id);
    assert_eq!(merged_history, expected);
}

#[tokio::test]
async fn test_merge_detects_both_modified_conflict() {
    // S5: both sides rewrote the same base decision differently.
    let base_decision = "for the storage layer we use flat files";
    let left_decision = "for the storage layer we use sqlite";
    let right_decision = "for the storage layer we use postgres";

    let mut script = setup_script();
    script.extend([
        ScriptedResponse::Text(state_json(&state(&[], &[base_decision], "storage"))),
        ScriptedResponse::Text(state_json(&state(&[], &[left_decision], "storage"))),
        ScriptedResponse::Text(state_json(&state(&[], &[right_decision], "storage"))),
        ScriptedResponse::Text("we need to settle the storage question".into()),
    ]);
    let (_dir, model, service) = service_with(script).await;

    let (id, _lca, tip_b1, _tip_b2) = diverged(&service).await;
    let outcome = service.merge_branches(&id, &tip_b1, "").await.unwrap();

    assert!(outcome.has_conflicts);
    assert_eq!(outcome.conflicts.len(), 1);
    let conflict = &outcome.conflicts[0];
    assert_eq!(conflict.category.as_str(), "decisions");
    assert_eq!(conflict.kind, ConflictKind::BothModified);
    assert_eq!(conflict.left_item, left_decision);
    assert_eq!(conflict.right_item, right_decision);

    // Recorded in the merge node's metadata too.
    let history = service.get_history(&id).await.unwrap();
    let metadata = history.last().unwrap().merge_metadata.as_ref().unwrap();
    assert_eq!(metadata.conflicts, outcome.conflicts);

    // And marked do-not-auto-resolve in the model prompt.
    let prompts = model.prompts.lock().unwrap();
    let final_prompt = prompts.last().unwrap()[1].content().to_string();
    assert!(final_prompt.contains("do not auto-resolve"));
    assert!(final_prompt.contains(left_decision));
}

#[tokio::test]
async fn test_summarization_failure_degrades_to_structural() {
    let mut script = setup_script();
    script.extend([
        // Base summary: unparseable twice, exhausting the retry.
        ScriptedResponse::Text("not json".into()),
        ScriptedResponse::Text("still not json".into()),
        // The other two summaries parse fine.
        ScriptedResponse::Text(state_json(&state(&["x=1"], &[], "left"))),
        ScriptedResponse::Text(state_json(&state(&["y=2"], &[], "right"))),
        ScriptedResponse::Text("merged from raw transcripts".into()),
    ]);
    let (_dir, model, service) = service_with(script).await;

    let (id, _lca, tip_b1, _tip_b2) = diverged(&service).await;
    let outcome = service.merge_branches(&id, &tip_b1, "").await.unwrap();

    // Structural-only mode: the merge completes but classifies nothing.
    assert!(!outcome.has_conflicts);
    assert!(outcome.conflicts.is_empty());

    let prompts = model.prompts.lock().unwrap();
    let final_prompt = prompts.last().unwrap()[1].content().to_string();
    assert!(final_prompt.contains("raw branches follow"));
    assert!(final_prompt.contains("Incoming branch transcript"));
}

#[tokio::test]
async fn test_failed_completion_aborts_without_state_change() {
    let mut script = setup_script();
    script.extend([
        ScriptedResponse::Text(state_json(&StateRecord::default())),
        ScriptedResponse::Text(state_json(&StateRecord::default())),
        ScriptedResponse::Text(state_json(&StateRecord::default())),
        ScriptedResponse::Error(ForkyError::ModelTimeout {
            seconds: forky::model::MODEL_TIMEOUT_SECS,
        }),
    ]);
    let (_dir, _model, service) = service_with(script).await;

    let (id, _lca, tip_b1, tip_b2) = diverged(&service).await;
    let before = service.get_graph(&id).await.unwrap();

    let result = service.merge_branches(&id, &tip_b1, "").await;
    assert!(matches!(result, Err(ForkyError::ModelTimeout { .. })));

    // Idempotent failure: no partial node, pointer unmoved.
    let after = service.get_graph(&id).await.unwrap();
    assert_eq!(after.nodes.len(), before.nodes.len());
    assert_eq!(after.current_node_id, tip_b2);
}

#[tokio::test]
async fn test_eligibility_is_symmetric() {
    let (_dir, _model, service) = service_with(setup_script()).await;
    let (id, lca, tip_b1, tip_b2) = diverged(&service).await;

    let forward = service.check_merge_eligibility(&id, &tip_b1, &tip_b2).await.unwrap();
    let backward = service.check_merge_eligibility(&id, &tip_b2, &tip_b1).await.unwrap();

    assert!(forward.eligible && backward.eligible);
    assert_eq!(forward.rejection_reason, backward.rejection_reason);
    assert_eq!(forward.lca_id, backward.lca_id);
    assert_eq!(forward.lca_id, Some(lca));
}

#[tokio::test]
async fn test_self_merge_rejected() {
    let (_dir, _model, service) = service_with(setup_script()).await;
    let (id, _lca, tip_b1, _tip_b2) = diverged(&service).await;

    let report = service.check_merge_eligibility(&id, &tip_b1, &tip_b1).await.unwrap();
    assert!(!report.eligible);
    assert_eq!(
        report.rejection_reason.unwrap().as_str(),
        "cannot_merge_node_with_itself"
    );

    let result = service.merge_branches(&id, &tip_b1, "").await;
    // The checkout is tip_b2 here, so merging tip_b1 is fine; force the
    // self case by checking out tip_b1 first.
    drop(result);
    service.checkout(&id, &tip_b1).await.unwrap();
    let result = service.merge_branches(&id, &tip_b1, "").await;
    assert!(matches!(
        result,
        Err(ForkyError::MergeIneligible {
            reason: forky::MergeRejection::CannotMergeNodeWithItself
        })
    ));
}

#[tokio::test]
async fn test_merge_persists_across_reopen() {
    use forky::{store::store_config_at, ServiceConfig};

    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        store: store_config_at(dir.path()),
        ..Default::default()
    };

    let (id, merge_id) = {
        let mut script = setup_script();
        script.extend([
            ScriptedResponse::Text(state_json(&state(&["x=1"], &[], "baseline"))),
            ScriptedResponse::Text(state_json(&state(&["x=1", "z=3"], &[], "left"))),
            ScriptedResponse::Text(state_json(&state(&["x=1", "y=2"], &[], "right"))),
            ScriptedResponse::Text("merged".into()),
        ]);
        let model = common::ScriptedModel::new(script);
        let service = ConversationService::open(config.clone(), model).await.unwrap();
        let (id, _lca, tip_b1, _tip_b2) = diverged(&service).await;
        let outcome = service.merge_branches(&id, &tip_b1, "").await.unwrap();
        (id, outcome.new_node_id)
    };

    let model = common::ScriptedModel::with_texts(&[]);
    let service = ConversationService::open(config, model).await.unwrap();
    let view = service.get_graph(&id).await.unwrap();
    assert_eq!(view.current_node_id, merge_id);
    let merge_view = view.nodes.iter().find(|n| n.id == merge_id).unwrap();
    assert_eq!(merge_view.parent_ids.len(), 2);
}
