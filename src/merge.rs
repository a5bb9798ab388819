/// Three-way semantic merge.
///
/// Merging two branches compares each against their lowest common ancestor
/// rather than against each other, the same shape as a git three-way merge
/// but over summarized conversation state instead of lines:
///
/// 1. eligibility (self-merge, ancestor/descendant, disconnected input)
/// 2. three histories - LCA, left (current checkout), right (target)
/// 3. three summarized states
/// 4. two diffs against the base state
/// 5. conflict classification over the diff overlap
/// 6. merge prompt synthesis
/// 7. model completion, which becomes the merge node's content
/// 8. commit: a two-parent node, pointer moved onto it
///
/// Conflicts are surfaced to the model and recorded in the merge node's
/// metadata; nothing auto-resolves them. Any failure in steps 3-7 aborts
/// with the graph untouched, so no partial merge is ever persisted.
use crate::conversation::Conversation;
use crate::diff::{diff, handle, normalize};
use crate::error::{ForkyError, ForkyResult, MergeRejection};
use crate::graph::ConversationGraph;
use crate::model::{ChatMessage, ModelClient};
use crate::summarizer::summarize;
use crate::types::{
    Category, ConflictKind, ConflictRecord, EligibilityReport, MergeOutcome, Node, StateDiff,
    StateRecord,
};
use tracing::{debug, info, warn};

const MERGE_INSTRUCTIONS: &str = "You are merging two branches of one conversation. \
You are given the state both branches started from, what each branch changed, and any \
conflicts between them. Write the single assistant turn that continues the merged \
conversation: reconcile what can be reconciled, and where conflicts are listed, do not \
silently pick a side - surface the conflict or ask a clarifying question.";

/// Decide whether two nodes can be merged.
///
/// Symmetric in its arguments apart from which side the LCA is reported
/// for. Fails with `UnknownNode` when either id is missing; an actual
/// rejection is reported in-band so callers can branch on the reason.
pub fn check_eligibility(
    graph: &ConversationGraph,
    a: &str,
    b: &str,
) -> ForkyResult<EligibilityReport> {
    graph.get(a)?;
    graph.get(b)?;

    if a == b {
        return Ok(EligibilityReport::rejected(
            MergeRejection::CannotMergeNodeWithItself,
        ));
    }

    // One ancestor-set walk per side serves all remaining checks.
    let ancestors_a = graph.ancestor_set(a);
    let ancestors_b = graph.ancestor_set(b);

    if ancestors_b.contains(a) || ancestors_a.contains(b) {
        return Ok(EligibilityReport::rejected(
            MergeRejection::CannotMergeAncestorWithDescendant,
        ));
    }

    match graph.lca_from_sets(&ancestors_a, &ancestors_b) {
        Some(lca_id) => Ok(EligibilityReport::eligible(lca_id)),
        None => Ok(EligibilityReport::rejected(
            MergeRejection::NoCommonAncestorFound,
        )),
    }
}

impl EligibilityReport {
    fn eligible(lca_id: String) -> Self {
        Self {
            eligible: true,
            rejection_reason: None,
            lca_id: Some(lca_id),
        }
    }

    fn rejected(reason: MergeRejection) -> Self {
        Self {
            eligible: false,
            rejection_reason: Some(reason),
            lca_id: None,
        }
    }
}

/// Classify the overlap between the two sides' diffs into conflicts.
///
/// Per category: **both_modified** when the same base item was changed on
/// both sides to different text; **contradicts** when one side added what
/// the other removed (by handle); **diverges** when both sides added
/// different items under one handle.
pub fn classify_conflicts(left: &StateDiff, right: &StateDiff) -> Vec<ConflictRecord> {
    let mut conflicts = Vec::new();

    for category in Category::ALL {
        for left_change in left.changed_in(category) {
            for right_change in right.changed_in(category) {
                if handle(&left_change.before) == handle(&right_change.before)
                    && normalize(&left_change.after) != normalize(&right_change.after)
                {
                    conflicts.push(ConflictRecord {
                        category,
                        left_item: left_change.after.clone(),
                        right_item: right_change.after.clone(),
                        kind: ConflictKind::BothModified,
                    });
                }
            }
        }

        for added in left.added_in(category) {
            for removed in right.removed_in(category) {
                if handle(added) == handle(removed) {
                    conflicts.push(ConflictRecord {
                        category,
                        left_item: added.clone(),
                        right_item: removed.clone(),
                        kind: ConflictKind::Contradicts,
                    });
                }
            }
        }
        for removed in left.removed_in(category) {
            for added in right.added_in(category) {
                if handle(removed) == handle(added) {
                    conflicts.push(ConflictRecord {
                        category,
                        left_item: removed.clone(),
                        right_item: added.clone(),
                        kind: ConflictKind::Contradicts,
                    });
                }
            }
        }

        for left_added in left.added_in(category) {
            for right_added in right.added_in(category) {
                if handle(left_added) == handle(right_added)
                    && normalize(left_added) != normalize(right_added)
                {
                    conflicts.push(ConflictRecord {
                        category,
                        left_item: left_added.clone(),
                        right_item: right_added.clone(),
                        kind: ConflictKind::Diverges,
                    });
                }
            }
        }
    }

    conflicts
}

/// Run the full merge pipeline on a conversation.
///
/// The left parent is always the conversation's current checkout; callers
/// wanting the other orientation check out first. On success the merge
/// node is inserted, the pointer moves onto it, and the outcome reports
/// any recorded conflicts. On failure the conversation is untouched.
pub async fn execute_merge(
    conversation: &mut Conversation,
    target_id: &str,
    merge_prompt: &str,
    model: &str,
    client: &dyn ModelClient,
) -> ForkyResult<MergeOutcome> {
    let current_id = conversation.current_node_id.clone();
    info!(conversation = %conversation.id, left = %current_id, right = %target_id, "merge requested");

    let report = check_eligibility(&conversation.graph, &current_id, target_id)?;
    let lca_id = match (report.eligible, report.lca_id, report.rejection_reason) {
        (true, Some(lca_id), _) => lca_id,
        (_, _, Some(reason)) => return Err(ForkyError::MergeIneligible { reason }),
        _ => unreachable!("ineligible reports always carry a reason"),
    };
    debug!(lca = %lca_id, "merge eligible");

    let base_history = conversation.graph.history(&lca_id)?;
    let left_history = conversation.graph.history(&current_id)?;
    let right_history = conversation.graph.history(target_id)?;

    let base_state = summarize(&base_history, model, client).await?;
    let left_state = summarize(&left_history, model, client).await?;
    let right_state = summarize(&right_history, model, client).await?;

    let structural_only = base_state.summarization_failed
        || left_state.summarization_failed
        || right_state.summarization_failed;

    let (left_diff, right_diff, conflicts) = if structural_only {
        warn!(conversation = %conversation.id, "summarization degraded, merging in structural-only mode");
        (StateDiff::default(), StateDiff::default(), Vec::new())
    } else {
        let left_diff = diff(&base_state, &left_state);
        let right_diff = diff(&base_state, &right_state);
        let conflicts = classify_conflicts(&left_diff, &right_diff);
        debug!(
            conflicts = conflicts.len(),
            "classified diff overlap"
        );
        (left_diff, right_diff, conflicts)
    };

    let messages = build_merge_prompt(
        &base_state,
        &left_diff,
        &right_diff,
        &conflicts,
        merge_prompt,
        structural_only.then_some((&left_history, &right_history)),
    )?;
    let content = client.complete(&messages, model).await?;

    // Everything above was read-only; commit is the only mutation.
    let merge_id = conversation.graph.insert_merge(
        &current_id,
        target_id,
        content,
        lca_id,
        conflicts.clone(),
    )?;
    conversation.current_node_id = merge_id.clone();
    info!(conversation = %conversation.id, merge = %merge_id, conflicts = conflicts.len(), "merge committed");

    Ok(MergeOutcome {
        new_node_id: merge_id,
        has_conflicts: !conflicts.is_empty(),
        conflicts,
    })
}

/// Assemble the final-completion prompt.
///
/// In structural-only mode the per-branch transcripts stand in for the
/// state diffs the summarizer could not produce.
fn build_merge_prompt(
    base_state: &StateRecord,
    left_diff: &StateDiff,
    right_diff: &StateDiff,
    conflicts: &[ConflictRecord],
    merge_prompt: &str,
    transcripts: Option<(&Vec<Node>, &Vec<Node>)>,
) -> ForkyResult<Vec<ChatMessage>> {
    let mut body = String::new();

    body.push_str("Baseline state at the common ancestor:\n");
    body.push_str(&serde_json::to_string_pretty(base_state)?);
    body.push('\n');

    match transcripts {
        None => {
            body.push_str("\nChanges on the current branch:\n");
            body.push_str(&serde_json::to_string_pretty(left_diff)?);
            body.push_str("\n\nChanges on the incoming branch:\n");
            body.push_str(&serde_json::to_string_pretty(right_diff)?);
            body.push('\n');

            if conflicts.is_empty() {
                body.push_str("\nNo conflicts were detected between the branches.\n");
            } else {
                body.push_str(
                    "\nConflicts (do not auto-resolve; surface them to the user or ask \
                     clarifying questions):\n",
                );
                body.push_str(&serde_json::to_string_pretty(conflicts)?);
                body.push('\n');
            }
        }
        Some((left_history, right_history)) => {
            body.push_str(
                "\nState summarization was unavailable; the raw branches follow.\n\
                 \nCurrent branch transcript:\n",
            );
            push_transcript(&mut body, left_history);
            body.push_str("\nIncoming branch transcript:\n");
            push_transcript(&mut body, right_history);
        }
    }

    if !merge_prompt.trim().is_empty() {
        body.push_str("\nMerge instruction from the user:\n");
        body.push_str(merge_prompt);
        body.push('\n');
    }

    Ok(vec![
        ChatMessage::System {
            content: MERGE_INSTRUCTIONS.to_string(),
        },
        ChatMessage::User { content: body },
    ])
}

fn push_transcript(body: &mut String, history: &[Node]) {
    for node in history {
        body.push_str(node.role.as_str());
        body.push_str(": ");
        body.push_str(&node.content);
        body.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangedItem;
    use std::collections::BTreeMap;

    fn diff_with_added(category: Category, items: &[&str]) -> StateDiff {
        let mut added = BTreeMap::new();
        added.insert(category, items.iter().map(|s| s.to_string()).collect());
        StateDiff {
            added,
            ..Default::default()
        }
    }

    fn diff_with_removed(category: Category, items: &[&str]) -> StateDiff {
        let mut removed = BTreeMap::new();
        removed.insert(category, items.iter().map(|s| s.to_string()).collect());
        StateDiff {
            removed,
            ..Default::default()
        }
    }

    fn diff_with_changed(category: Category, before: &str, after: &str) -> StateDiff {
        let mut changed = BTreeMap::new();
        changed.insert(
            category,
            vec![ChangedItem {
                before: before.to_string(),
                after: after.to_string(),
            }],
        );
        StateDiff {
            changed,
            ..Default::default()
        }
    }

    #[test]
    fn test_eligibility_rejects_self_merge() {
        let graph = ConversationGraph::new();
        let root = graph.root_id().clone();
        let report = check_eligibility(&graph, &root, &root).unwrap();
        assert!(!report.eligible);
        assert_eq!(
            report.rejection_reason,
            Some(MergeRejection::CannotMergeNodeWithItself)
        );
        assert!(report.lca_id.is_none());
    }

    #[test]
    fn test_eligibility_rejects_ancestor() {
        let mut graph = ConversationGraph::new();
        let root = graph.root_id().clone();
        let child = graph
            .append(&root, crate::types::Role::User, "hi", Vec::new())
            .unwrap();

        for (a, b) in [(&root, &child), (&child, &root)] {
            let report = check_eligibility(&graph, a, b).unwrap();
            assert!(!report.eligible);
            assert_eq!(
                report.rejection_reason,
                Some(MergeRejection::CannotMergeAncestorWithDescendant)
            );
        }
    }

    #[test]
    fn test_eligibility_accepts_diverged_branches() {
        let mut graph = ConversationGraph::new();
        let root = graph.root_id().clone();
        let a = graph
            .append(&root, crate::types::Role::User, "a", Vec::new())
            .unwrap();
        let b = graph
            .append(&root, crate::types::Role::User, "b", Vec::new())
            .unwrap();

        let forward = check_eligibility(&graph, &a, &b).unwrap();
        let backward = check_eligibility(&graph, &b, &a).unwrap();
        assert!(forward.eligible);
        assert!(backward.eligible);
        // Symmetric modulo nothing: same LCA both ways.
        assert_eq!(forward.lca_id, backward.lca_id);
        assert_eq!(forward.lca_id, Some(root));
    }

    #[test]
    fn test_eligibility_unknown_node() {
        let graph = ConversationGraph::new();
        let root = graph.root_id().clone();
        let result = check_eligibility(&graph, &root, "ghost");
        assert!(matches!(result, Err(ForkyError::UnknownNode { .. })));
    }

    #[test]
    fn test_classify_both_modified() {
        let left = diff_with_changed(
            Category::Decisions,
            "for the storage layer we use flat files",
            "for the storage layer we use postgres",
        );
        let right = diff_with_changed(
            Category::Decisions,
            "for the storage layer we use flat files",
            "for the storage layer we use sqlite",
        );

        let conflicts = classify_conflicts(&left, &right);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::BothModified);
        assert_eq!(conflicts[0].category, Category::Decisions);
        assert!(conflicts[0].left_item.contains("postgres"));
        assert!(conflicts[0].right_item.contains("sqlite"));
    }

    #[test]
    fn test_same_change_on_both_sides_is_not_a_conflict() {
        let left = diff_with_changed(Category::Facts, "the api version is one", "the api version is two");
        let right = diff_with_changed(Category::Facts, "the api version is one", "The api version is two");
        assert!(classify_conflicts(&left, &right).is_empty());
    }

    #[test]
    fn test_classify_contradicts_both_directions() {
        let added = diff_with_added(Category::Facts, &["the cache layer is redis backed"]);
        let removed = diff_with_removed(Category::Facts, &["the cache layer is redis optional"]);

        let forward = classify_conflicts(&added, &removed);
        assert_eq!(forward.len(), 1);
        assert_eq!(forward[0].kind, ConflictKind::Contradicts);

        let backward = classify_conflicts(&removed, &added);
        assert_eq!(backward.len(), 1);
        assert_eq!(backward[0].kind, ConflictKind::Contradicts);
    }

    #[test]
    fn test_classify_diverges() {
        let left = diff_with_added(Category::Assumptions, &["users sign in with email magic links"]);
        let right = diff_with_added(Category::Assumptions, &["users sign in with email and password"]);

        let conflicts = classify_conflicts(&left, &right);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::Diverges);
    }

    #[test]
    fn test_disjoint_additions_do_not_conflict() {
        let left = diff_with_added(Category::Facts, &["y=2"]);
        let right = diff_with_added(Category::Facts, &["z=3"]);
        assert!(classify_conflicts(&left, &right).is_empty());
    }

    #[test]
    fn test_merge_prompt_marks_conflicts() {
        let conflicts = vec![ConflictRecord {
            category: Category::Decisions,
            left_item: "use postgres".to_string(),
            right_item: "use sqlite".to_string(),
            kind: ConflictKind::BothModified,
        }];
        let messages = build_merge_prompt(
            &StateRecord::default(),
            &StateDiff::default(),
            &StateDiff::default(),
            &conflicts,
            "keep it short",
            None,
        )
        .unwrap();

        assert_eq!(messages.len(), 2);
        let body = messages[1].content();
        assert!(body.contains("do not auto-resolve"));
        assert!(body.contains("use postgres"));
        assert!(body.contains("keep it short"));
    }

    #[test]
    fn test_merge_prompt_structural_mode_carries_transcripts() {
        let left = vec![Node::root()];
        let right = vec![Node::root()];
        let messages = build_merge_prompt(
            &StateRecord::failed(),
            &StateDiff::default(),
            &StateDiff::default(),
            &[],
            "",
            Some((&left, &right)),
        )
        .unwrap();
        let body = messages[1].content();
        assert!(body.contains("raw branches follow"));
        assert!(body.contains("Current branch transcript"));
    }
}
