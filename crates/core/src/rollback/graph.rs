use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::domain::context::OperationId;
use crate::rollback::{RollbackOperation, WriteKind};

/// For every operation, the operations that must be rolled back before it.
///
/// Explicit dependencies are kept as declared (references outside the session
/// are dropped). Implicit edges on the same table:
/// * same row: the newer write is undone first;
/// * different rows: insert and update rollbacks wait for delete rollbacks.
pub fn build_dependencies(
    operations: &[RollbackOperation],
) -> BTreeMap<OperationId, BTreeSet<OperationId>> {
    let known: BTreeSet<&OperationId> =
        operations.iter().map(|operation| &operation.operation_id).collect();
    let mut graph = BTreeMap::new();

    for operation in operations {
        let mut before = BTreeSet::new();
        for dependency in &operation.dependencies {
            if known.contains(dependency) && dependency != &operation.operation_id {
                before.insert(dependency.clone());
            } else if dependency != &operation.operation_id {
                warn!(
                    event_name = "recovery.rollback.unknown_dependency",
                    operation_id = %operation.operation_id,
                    dependency = %dependency,
                    "dependency is not part of the session, ignoring"
                );
            }
        }

        for other in operations {
            if other.operation_id == operation.operation_id
                || other.table_name != operation.table_name
            {
                continue;
            }
            let must_wait = if operation.touches_same_row(other) {
                other.is_newer_than(operation)
            } else {
                matches!(operation.operation_type, WriteKind::Insert | WriteKind::Update)
                    && other.operation_type == WriteKind::Delete
            };
            if must_wait {
                before.insert(other.operation_id.clone());
            }
        }

        graph.insert(operation.operation_id.clone(), before);
    }

    graph
}

/// Groups operations into batches that can run concurrently, in execution
/// order. Within a batch the newest operation comes first.
///
/// A cycle is broken by forcing the lowest `operation_id` among the
/// remaining operations that sit on a cycle, so planning always terminates.
/// Operations that merely wait on a cycle keep their ordering.
pub fn plan_batches(operations: &[RollbackOperation]) -> Vec<Vec<OperationId>> {
    let graph = build_dependencies(operations);
    let mut remaining: Vec<&RollbackOperation> = operations.iter().collect();
    remaining.sort_by(|left, right| {
        (right.created_at, right.sequence).cmp(&(left.created_at, left.sequence))
    });

    let mut resolved: BTreeSet<OperationId> = BTreeSet::new();
    let mut batches = Vec::new();

    while !remaining.is_empty() {
        let mut batch: Vec<OperationId> = remaining
            .iter()
            .filter(|operation| {
                graph
                    .get(&operation.operation_id)
                    .map(|before| before.iter().all(|dependency| resolved.contains(dependency)))
                    .unwrap_or(true)
            })
            .map(|operation| operation.operation_id.clone())
            .collect();

        if batch.is_empty() {
            let forced = remaining
                .iter()
                .map(|operation| &operation.operation_id)
                .filter(|operation_id| on_cycle(operation_id, &graph, &resolved))
                .min()
                .or_else(|| remaining.iter().map(|operation| &operation.operation_id).min());
            if let Some(operation_id) = forced {
                warn!(
                    event_name = "recovery.rollback.cycle_broken",
                    operation_id = %operation_id,
                    remaining = remaining.len(),
                    "dependency cycle detected, forcing operation"
                );
                batch.push(operation_id.clone());
            }
        }

        remaining.retain(|operation| !batch.contains(&operation.operation_id));
        resolved.extend(batch.iter().cloned());
        batches.push(batch);
    }

    batches
}

/// Whether `start` can reach itself through unresolved dependencies.
fn on_cycle(
    start: &OperationId,
    graph: &BTreeMap<OperationId, BTreeSet<OperationId>>,
    resolved: &BTreeSet<OperationId>,
) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&OperationId> = vec![start];

    while let Some(current) = stack.pop() {
        let Some(before) = graph.get(current) else {
            continue;
        };
        for dependency in before.iter().filter(|dependency| !resolved.contains(*dependency)) {
            if dependency == start {
                return true;
            }
            if seen.insert(dependency) {
                stack.push(dependency);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    use super::{build_dependencies, plan_batches};
    use crate::domain::context::OperationId;
    use crate::rollback::{RollbackData, RollbackOperation, StoreKind, WriteKind};

    fn id(value: &str) -> OperationId {
        OperationId(value.to_owned())
    }

    fn row(key: i64) -> BTreeMap<String, Value> {
        BTreeMap::from([("id".to_owned(), Value::from(key))])
    }

    fn op(name: &str, table: &str, kind: WriteKind, key: i64, sequence: u64) -> RollbackOperation {
        let data = match kind {
            WriteKind::Insert => RollbackData::for_insert(StoreKind::Relational, row(key)),
            WriteKind::Update => RollbackData::for_update(StoreKind::Relational, row(key), row(key)),
            WriteKind::Delete => RollbackData::for_delete(StoreKind::Relational, row(key), row(key)),
        };
        let mut operation = RollbackOperation::new(id(name), table, kind, data, sequence);
        operation.created_at = Utc.timestamp_opt(0, 0).single().expect("epoch");
        operation
    }

    #[test]
    fn independent_tables_share_one_batch_newest_first() {
        let operations = vec![
            op("a", "runs", WriteKind::Insert, 1, 0),
            op("b", "metrics", WriteKind::Insert, 1, 1),
        ];

        assert_eq!(plan_batches(&operations), vec![vec![id("b"), id("a")]]);
    }

    #[test]
    fn inserts_and_updates_wait_for_deletes_on_the_same_table() {
        let operations = vec![
            op("delete", "runs", WriteKind::Delete, 1, 0),
            op("insert", "runs", WriteKind::Insert, 2, 1),
            op("update", "runs", WriteKind::Update, 3, 2),
        ];

        let batches = plan_batches(&operations);

        assert_eq!(batches, vec![vec![id("delete")], vec![id("update"), id("insert")]]);
    }

    #[test]
    fn same_row_writes_are_undone_newest_first() {
        let operations = vec![
            op("inserted", "runs", WriteKind::Insert, 7, 0),
            op("updated", "runs", WriteKind::Update, 7, 1),
            op("deleted", "runs", WriteKind::Delete, 7, 2),
        ];

        let batches = plan_batches(&operations);

        assert_eq!(batches, vec![vec![id("deleted")], vec![id("updated")], vec![id("inserted")]]);
    }

    #[test]
    fn explicit_dependencies_are_honoured_and_unknown_ones_ignored() {
        let operations = vec![
            op("parent", "agents", WriteKind::Insert, 1, 0)
                .with_dependencies([id("child"), id("elsewhere")]),
            op("child", "agent_runs", WriteKind::Insert, 1, 1),
        ];

        let graph = build_dependencies(&operations);
        assert_eq!(graph[&id("parent")].len(), 1);
        assert_eq!(plan_batches(&operations), vec![vec![id("child")], vec![id("parent")]]);
    }

    #[test]
    fn cycles_are_broken_at_lowest_operation_id() {
        let operations = vec![
            op("op-b", "a", WriteKind::Insert, 1, 0).with_dependencies([id("op-c")]),
            op("op-c", "b", WriteKind::Insert, 1, 1).with_dependencies([id("op-b")]),
            op("op-d", "c", WriteKind::Insert, 1, 2).with_dependencies([id("op-b")]),
        ];

        let batches = plan_batches(&operations);

        assert_eq!(batches, vec![vec![id("op-b")], vec![id("op-d"), id("op-c")]]);
    }

    #[test]
    fn operation_waiting_on_a_cycle_is_not_forced_ahead_of_it() {
        let operations = vec![
            op("op-a", "a", WriteKind::Insert, 1, 0).with_dependencies([id("op-b")]),
            op("op-b", "b", WriteKind::Insert, 1, 1).with_dependencies([id("op-c")]),
            op("op-c", "c", WriteKind::Insert, 1, 2).with_dependencies([id("op-b")]),
        ];

        let batches = plan_batches(&operations);

        assert_eq!(batches, vec![vec![id("op-b")], vec![id("op-c"), id("op-a")]]);
    }

    #[test]
    fn empty_session_plans_nothing() {
        assert!(plan_batches(&[]).is_empty());
    }
}
