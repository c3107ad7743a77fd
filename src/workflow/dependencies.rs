use std::collections::{HashMap, HashSet, VecDeque};

use diesel::prelude::*;
use diesel::sql_types::BigInt;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    schema::document_dependencies,
};

/// Upper bound on documents visited while looking for a cycle.
pub const MAX_TRAVERSAL: usize = 10_000;

pub const DEPENDENCY_TYPES: [&str; 4] = ["REFERENCE", "TEMPLATE", "SUPPORTS", "IMPLEMENTS"];

/// Advisory lock key serializing edits to the dependency graph.
const GRAPH_LOCK_KEY: i64 = 0x4544_4d53_4445_5053;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleCheck {
    Acyclic,
    /// `document -> depends_on -> ... -> document`
    Cycle(Vec<Uuid>),
    /// The traversal gave up before proving the edge safe.
    LimitReached { visited: usize },
}

/// Checks whether adding the edge `document -> depends_on` would close a cycle.
///
/// `edges_from(id)` yields the documents `id` already depends on.
pub fn find_cycle<E>(
    document: Uuid,
    depends_on: Uuid,
    limit: usize,
    mut edges_from: impl FnMut(Uuid) -> Result<Vec<Uuid>, E>,
) -> Result<CycleCheck, E> {
    if document == depends_on {
        return Ok(CycleCheck::Cycle(vec![document, document]));
    }

    let mut parents: HashMap<Uuid, Uuid> = HashMap::new();
    let mut seen: HashSet<Uuid> = HashSet::from([depends_on]);
    let mut queue = VecDeque::from([depends_on]);

    while let Some(current) = queue.pop_front() {
        if seen.len() > limit {
            return Ok(CycleCheck::LimitReached { visited: seen.len() });
        }
        for next in edges_from(current)? {
            if next == document {
                let mut path = vec![document, current];
                let mut cursor = current;
                while let Some(parent) = parents.get(&cursor) {
                    path.push(*parent);
                    cursor = *parent;
                }
                // path is document, current, ..., depends_on; flip the tail to walk forward
                path[1..].reverse();
                path.push(document);
                return Ok(CycleCheck::Cycle(path));
            }
            if seen.insert(next) {
                parents.insert(next, current);
                queue.push_back(next);
            }
        }
    }

    Ok(CycleCheck::Acyclic)
}

/// Blocks until no other transaction is editing the dependency graph.
/// Released when the surrounding transaction ends.
pub fn lock_dependency_graph(conn: &mut PgConnection) -> AppResult<()> {
    diesel::sql_query("SELECT pg_advisory_xact_lock($1)")
        .bind::<BigInt, _>(GRAPH_LOCK_KEY)
        .execute(conn)?;
    Ok(())
}

pub fn load_dependency_targets(conn: &mut PgConnection, document_id: Uuid) -> AppResult<Vec<Uuid>> {
    let ids = document_dependencies::table
        .filter(document_dependencies::document_id.eq(document_id))
        .select(document_dependencies::depends_on_id)
        .load(conn)?;
    Ok(ids)
}

/// Must run inside the transaction that inserts the edge.
pub fn ensure_acyclic(conn: &mut PgConnection, document_id: Uuid, depends_on_id: Uuid) -> AppResult<()> {
    lock_dependency_graph(conn)?;
    let check = find_cycle(document_id, depends_on_id, MAX_TRAVERSAL, |id| {
        load_dependency_targets(conn, id)
    })?;

    match check {
        CycleCheck::Acyclic => Ok(()),
        CycleCheck::Cycle(path) => {
            let rendered = path
                .iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>()
                .join(" -> ");
            Err(AppError::conflict("dependency would create a cycle").with_detail(rendered))
        }
        CycleCheck::LimitReached { visited } => Err(AppError::conflict(
            "dependency graph too large to verify the new link",
        )
        .with_detail(format!("gave up after {visited} documents"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn graph(edges: &[(Uuid, Uuid)]) -> impl FnMut(Uuid) -> Result<Vec<Uuid>, Infallible> + '_ {
        move |from| {
            Ok(edges
                .iter()
                .filter(|(a, _)| *a == from)
                .map(|(_, b)| *b)
                .collect())
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let a = Uuid::new_v4();
        let check = find_cycle(a, a, MAX_TRAVERSAL, graph(&[])).unwrap();
        assert_eq!(check, CycleCheck::Cycle(vec![a, a]));
    }

    #[test]
    fn detects_indirect_cycle_with_path() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        // b -> c -> a already exists; adding a -> b closes the loop
        let edges = [(b, c), (c, a)];
        let check = find_cycle(a, b, MAX_TRAVERSAL, graph(&edges)).unwrap();
        assert_eq!(check, CycleCheck::Cycle(vec![a, b, c, a]));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let edges = [(b, d), (c, d), (a, c)];
        assert_eq!(
            find_cycle(a, b, MAX_TRAVERSAL, graph(&edges)).unwrap(),
            CycleCheck::Acyclic
        );
    }

    #[test]
    fn traversal_limit_is_inconclusive_not_acyclic() {
        let nodes: Vec<Uuid> = (0..20).map(|_| Uuid::new_v4()).collect();
        let mut edges: Vec<(Uuid, Uuid)> = nodes.windows(2).map(|w| (w[0], w[1])).collect();
        let start = Uuid::new_v4();
        edges.push((nodes[19], start));

        assert!(matches!(
            find_cycle(start, nodes[0], MAX_TRAVERSAL, graph(&edges)).unwrap(),
            CycleCheck::Cycle(_)
        ));
        assert!(matches!(
            find_cycle(start, nodes[0], 5, graph(&edges)).unwrap(),
            CycleCheck::LimitReached { .. }
        ));

        // A long chain with no way back is still refused once the budget runs out.
        let open_chain = &edges[..edges.len() - 1];
        assert!(matches!(
            find_cycle(start, nodes[0], 5, graph(open_chain)).unwrap(),
            CycleCheck::LimitReached { .. }
        ));
        assert_eq!(
            find_cycle(start, nodes[0], MAX_TRAVERSAL, graph(open_chain)).unwrap(),
            CycleCheck::Acyclic
        );
    }
}
