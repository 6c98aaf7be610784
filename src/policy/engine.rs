//! The admission decision engine.
//!
//! `decide` maps `(source IP, proxy IP, protocol, login)` to an admission
//! or a deny reason, evaluating candidate policies deterministically
//! (open-ended grants first, then oldest first). Group membership is
//! transitive over both trees via one BFS primitive with a visited-set
//! cycle guard and a depth cap.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::core::errors::GatewayError;
use crate::core::stay::Protocol;
use crate::routing::RoutingTable;
use crate::store::{GroupKind, SqliteStore};

use super::{Admission, Decision, DenyReason, ScopeKind};

/// Both group trees cap out at this depth; deeper links are treated as
/// broken and ignored.
pub const MAX_GROUP_DEPTH: usize = 10;

/// Outcome of re-evaluating a stay's admitting policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconfirm {
    /// Still admits; carries the policy's current expiry (it may have
    /// been extended).
    Admitted(Option<chrono::DateTime<Utc>>),
    /// The policy was revoked (or deleted).
    Revoked,
    /// The policy ran out of its window, schedule, or login list.
    NoLongerAdmits,
}

/// The engine, constructed once at startup and injected into the
/// front-ends and the expiry ticker.
pub struct PolicyEngine {
    store: Arc<SqliteStore>,
    routing: Arc<RoutingTable>,
    budget: Duration,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine").finish_non_exhaustive()
    }
}

impl PolicyEngine {
    /// Create an engine over the store and routing table.
    #[must_use]
    pub const fn new(store: Arc<SqliteStore>, routing: Arc<RoutingTable>, budget: Duration) -> Self {
        Self {
            store,
            routing,
            budget,
        }
    }

    /// Decide whether to admit `(src_ip, proxy_ip, protocol, login)`.
    ///
    /// The evaluation runs under the engine's time budget; on overrun the
    /// decision is a deny with `no_matching_policy` (the caller's audit
    /// row carries the detail).
    ///
    /// # Errors
    ///
    /// Returns store faults; a slow evaluation is a deny, not an error.
    pub async fn decide(
        &self,
        src_ip: IpAddr,
        proxy_ip: IpAddr,
        protocol: Protocol,
        login: Option<&str>,
    ) -> Result<Decision, GatewayError> {
        match tokio::time::timeout(self.budget, self.evaluate(src_ip, proxy_ip, protocol, login))
            .await
        {
            Ok(decision) => decision,
            Err(_) => {
                tracing::warn!(
                    %src_ip, %proxy_ip, %protocol,
                    budget_ms = self.budget.as_millis() as u64,
                    "policy evaluation exceeded budget, denying"
                );
                Ok(Decision::Deny(DenyReason::NoMatchingPolicy))
            }
        }
    }

    async fn evaluate(
        &self,
        src_ip: IpAddr,
        proxy_ip: IpAddr,
        protocol: Protocol,
        login: Option<&str>,
    ) -> Result<Decision, GatewayError> {
        let directory = self.store.directory();

        // 1. Source IP → person, exact host match first then longest prefix.
        let Some((person, source_entry)) = directory.person_for_source_ip(src_ip).await? else {
            return Ok(Decision::Deny(DenyReason::NoPersonForSourceIp));
        };

        // 2. Proxy IP → backend.
        let Some(backend) = self.routing.resolve(proxy_ip).await? else {
            return Ok(Decision::Deny(DenyReason::NoBackendForProxyIp));
        };
        if !backend.active {
            return Ok(Decision::Deny(DenyReason::BackendDisabled));
        }
        if !backend.supports(protocol) {
            return Ok(Decision::Deny(DenyReason::ProtocolNotAllowed));
        }

        // 3./4. Transitive group sets for both sides.
        let user_groups = self.ancestor_set(GroupKind::User, person.id).await?;
        let server_groups = self.ancestor_set(GroupKind::Server, backend.id).await?;

        // 5. Candidates by subject, in deterministic evaluation order.
        let user_group_ids: Vec<Uuid> = user_groups.iter().copied().collect();
        let candidates = self
            .store
            .policies()
            .candidates_for(person.id, &user_group_ids)
            .await?;

        // 6.-8. First surviving candidate admits; otherwise report the
        // failure observed closest to admission.
        let now = Utc::now();
        let mut most_specific: Option<DenyReason> = None;
        let observe = |reason: DenyReason, seen: &mut Option<DenyReason>| {
            if seen.is_none_or(|s| reason > s) {
                *seen = Some(reason);
            }
        };

        for policy in candidates {
            let in_scope = match policy.scope_kind {
                ScopeKind::Server | ScopeKind::Service => policy.scope_id == backend.id,
                ScopeKind::ServerGroup => server_groups.contains(&policy.scope_id),
            };
            if !in_scope {
                continue;
            }

            if let Some(pinned) = policy.source_ip_id {
                if pinned != source_entry.id {
                    continue;
                }
            }

            if !policy.covers_protocol(protocol) {
                observe(DenyReason::ProtocolNotAllowed, &mut most_specific);
                continue;
            }

            if !policy.in_time_window(now) {
                observe(DenyReason::PolicyExpired, &mut most_specific);
                continue;
            }

            if let Some(schedule) = &policy.schedule {
                if !schedule.contains(now) {
                    observe(DenyReason::OutsideSchedule, &mut most_specific);
                    continue;
                }
            }

            if let Some(login) = login {
                if !policy.permits_login(login) {
                    observe(DenyReason::LoginNotPermitted, &mut most_specific);
                    continue;
                }
            }

            return Ok(Decision::Admit(Admission {
                person_id: person.id,
                policy_id: policy.id,
                backend,
                allow_port_forwarding: policy.allow_port_forwarding,
                ssh_login_filter: policy.ssh_logins,
                valid_until: policy.ends_at,
            }));
        }

        Ok(Decision::Deny(
            most_specific.unwrap_or(DenyReason::NoMatchingPolicy),
        ))
    }

    /// Re-evaluate a stay's admitting policy.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn reconfirm(
        &self,
        policy_id: Uuid,
        login: Option<&str>,
    ) -> Result<Reconfirm, GatewayError> {
        let Some(policy) = self.store.policies().by_id(policy_id).await? else {
            return Ok(Reconfirm::Revoked);
        };
        if !policy.active {
            return Ok(Reconfirm::Revoked);
        }
        let now = Utc::now();
        if !policy.in_time_window(now) {
            return Ok(Reconfirm::NoLongerAdmits);
        }
        if let Some(schedule) = &policy.schedule {
            if !schedule.contains(now) {
                return Ok(Reconfirm::NoLongerAdmits);
            }
        }
        if let Some(login) = login {
            if !policy.permits_login(login) {
                return Ok(Reconfirm::NoLongerAdmits);
            }
        }
        Ok(Reconfirm::Admitted(policy.ends_at))
    }

    /// Check whether re-parenting `group_id` under `new_parent_id` keeps
    /// the tree cycle-free.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn validate_no_cycle(
        &self,
        kind: GroupKind,
        group_id: Uuid,
        new_parent_id: Option<Uuid>,
    ) -> Result<bool, GatewayError> {
        let edges = self.store.directory().group_edges(kind).await?;
        Ok(parent_link_is_acyclic(&edges, group_id, new_parent_id))
    }

    /// Transitive member set of a group: the group itself plus every
    /// descendant group.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn group_closure(
        &self,
        kind: GroupKind,
        group_id: Uuid,
    ) -> Result<HashSet<Uuid>, GatewayError> {
        let edges = self.store.directory().group_edges(kind).await?;

        let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for (id, parent) in edges {
            if let Some(parent) = parent {
                children.entry(parent).or_default().push(id);
            }
        }

        Ok(bfs([group_id], &children, MAX_GROUP_DEPTH))
    }

    /// Direct groups of an entity plus every ancestor group: the set a
    /// policy subject or scope may name to cover it.
    async fn ancestor_set(
        &self,
        kind: GroupKind,
        entity_id: Uuid,
    ) -> Result<HashSet<Uuid>, GatewayError> {
        let directory = self.store.directory();
        let direct = match kind {
            GroupKind::User => directory.user_groups_of_person(entity_id).await?,
            GroupKind::Server => directory.server_groups_of_backend(entity_id).await?,
        };
        let edges = directory.group_edges(kind).await?;

        let mut parents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for (id, parent) in edges {
            if let Some(parent) = parent {
                parents.entry(id).or_default().push(parent);
            }
        }

        Ok(bfs(direct, &parents, MAX_GROUP_DEPTH))
    }
}

/// Breadth-first walk over a group adjacency map with a visited-set cycle
/// guard and a depth cap. Start nodes are part of the result.
fn bfs(
    start: impl IntoIterator<Item = Uuid>,
    edges: &HashMap<Uuid, Vec<Uuid>>,
    max_depth: usize,
) -> HashSet<Uuid> {
    let mut visited: HashSet<Uuid> = HashSet::new();
    let mut queue: VecDeque<(Uuid, usize)> = VecDeque::new();

    for node in start {
        if visited.insert(node) {
            queue.push_back((node, 0));
        }
    }

    while let Some((node, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        if let Some(next) = edges.get(&node) {
            for &n in next {
                if visited.insert(n) {
                    queue.push_back((n, depth + 1));
                }
            }
        }
    }

    visited
}

/// Whether attaching `group_id` under `new_parent_id` keeps the parent
/// links cycle-free and inside the depth cap. Shared by the store's group
/// write path.
#[must_use]
pub fn parent_link_is_acyclic(
    edges: &[(Uuid, Option<Uuid>)],
    group_id: Uuid,
    new_parent_id: Option<Uuid>,
) -> bool {
    let Some(new_parent) = new_parent_id else {
        return true;
    };
    if new_parent == group_id {
        return false;
    }

    let parents: HashMap<Uuid, Uuid> = edges
        .iter()
        .filter_map(|(id, parent)| parent.map(|p| (*id, p)))
        .collect();

    // Walk up from the prospective parent; reaching the group again is a
    // cycle, and running past the depth cap is refused the same way.
    let mut current = new_parent;
    for _ in 0..MAX_GROUP_DEPTH {
        match parents.get(&current) {
            Some(&parent) if parent == group_id => return false,
            Some(&parent) => current = parent,
            None => return true,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn bfs_collects_ancestors_and_guards_cycles() {
        let g = ids(3);
        // g0 -> g1 -> g2 -> g0 (a cycle that should not loop forever).
        let mut edges: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        edges.insert(g[0], vec![g[1]]);
        edges.insert(g[1], vec![g[2]]);
        edges.insert(g[2], vec![g[0]]);

        let reached = bfs([g[0]], &edges, MAX_GROUP_DEPTH);
        assert_eq!(reached.len(), 3);
    }

    #[test]
    fn bfs_respects_depth_cap() {
        let chain = ids(15);
        let mut edges: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for pair in chain.windows(2) {
            edges.insert(pair[0], vec![pair[1]]);
        }

        let reached = bfs([chain[0]], &edges, MAX_GROUP_DEPTH);
        assert_eq!(reached.len(), MAX_GROUP_DEPTH + 1);
    }

    #[test]
    fn self_parent_is_a_cycle() {
        let g = ids(1);
        assert!(!parent_link_is_acyclic(&[(g[0], None)], g[0], Some(g[0])));
    }

    #[test]
    fn reattaching_descendant_as_parent_is_a_cycle() {
        let g = ids(3);
        // g2 -> g1 -> g0.
        let edges = vec![(g[0], None), (g[1], Some(g[0])), (g[2], Some(g[1]))];
        // Making g2 the parent of g0 closes the loop.
        assert!(!parent_link_is_acyclic(&edges, g[0], Some(g[2])));
        // A sibling attachment is fine.
        assert!(parent_link_is_acyclic(&edges, g[2], Some(g[0])));
    }

    #[test]
    fn detaching_is_always_acyclic() {
        let g = ids(2);
        let edges = vec![(g[0], None), (g[1], Some(g[0]))];
        assert!(parent_link_is_acyclic(&edges, g[1], None));
    }
}
