use std::collections::{btree_map, BTreeMap};

use chrono::{DateTime, Utc};
use tracing::debug;

/// Planned change of a single provisioning group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMutation {
    /// Replica count before the run.
    pub previous_replicas: i32,
    /// Replica count the group is grown to.
    pub target_replicas: i32,
    /// When the replica change was issued, unset until the driver mutates the group.
    pub last_mutation: Option<DateTime<Utc>>,
}

impl GroupMutation {
    /// Number of replicas added to the group.
    pub fn increments(&self) -> u32 {
        (self.target_replicas - self.previous_replicas).max(0) as u32
    }
}

/// Group name to planned mutation, owned by a single scale run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupMutationPlan(BTreeMap<String, GroupMutation>);

impl GroupMutationPlan {
    /// Report whether no group is touched.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of touched groups.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Planned mutation of a group.
    pub fn get(&self, group: &str) -> Option<&GroupMutation> {
        self.0.get(group)
    }

    /// Replace the entry of a group.
    pub fn insert(&mut self, group: String, mutation: GroupMutation) {
        self.0.insert(group, mutation);
    }

    /// Iterate over groups in name order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, GroupMutation> {
        self.0.iter()
    }

    /// Total replicas added across all groups.
    pub fn increments(&self) -> u32 {
        self.0.values().map(GroupMutation::increments).sum()
    }

    /// Plan that brings every group back to its previous replica count.
    pub fn reverted(&self) -> Self {
        self.0
            .iter()
            .map(|(name, mutation)| {
                (
                    name.clone(),
                    GroupMutation {
                        previous_replicas: mutation.target_replicas,
                        target_replicas: mutation.previous_replicas,
                        last_mutation: None,
                    },
                )
            })
            .collect()
    }
}

impl FromIterator<(String, GroupMutation)> for GroupMutationPlan {
    fn from_iter<T: IntoIterator<Item = (String, GroupMutation)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for GroupMutationPlan {
    type Item = (String, GroupMutation);
    type IntoIter = btree_map::IntoIter<String, GroupMutation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Spread `additional` single replica increments over the groups, always
/// growing the least populated groups first.
///
/// The snapshot maps a replica count to the names of the groups currently at
/// that count. Groups reaching `max_replicas` are no longer grown, so the
/// returned plan may hold fewer increments than requested.
pub fn plan_allocation(
    snapshot: &BTreeMap<i32, Vec<String>>,
    additional: u32,
    max_replicas: Option<i32>,
) -> GroupMutationPlan {
    let mut buckets = snapshot.clone();
    let mut plan = GroupMutationPlan::default();
    let mut remaining = additional;

    while remaining > 0 {
        let Some((&replicas, _)) = buckets
            .iter()
            .find(|(replicas, groups)| !groups.is_empty() && below_cap(**replicas, max_replicas))
        else {
            debug!(remaining, "no group left to grow");
            break;
        };
        let groups = buckets.remove(&replicas).unwrap_or_default();
        let mut promoted = Vec::new();
        let mut untouched = Vec::new();
        for group in groups {
            if remaining == 0 {
                untouched.push(group);
                continue;
            }
            remaining -= 1;
            plan.0
                .entry(group.clone())
                .and_modify(|mutation| mutation.target_replicas = replicas + 1)
                .or_insert(GroupMutation {
                    previous_replicas: replicas,
                    target_replicas: replicas + 1,
                    last_mutation: None,
                });
            promoted.push(group);
        }
        if !untouched.is_empty() {
            buckets.insert(replicas, untouched);
        }
        buckets.entry(replicas + 1).or_default().extend(promoted);
    }
    plan
}

fn below_cap(replicas: i32, max_replicas: Option<i32>) -> bool {
    max_replicas.map_or(true, |max| replicas < max)
}
