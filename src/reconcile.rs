//! # Reconciliation Planning
//!
//! Turns the diff between the local index and a peer's summary into a list
//! of actions, given the local Secret level and the session's effective
//! capability. Planning is pure: executing the plan is [`crate::sync`]'s job.
//!
//! | Delta | Rule |
//! |---|---|
//! | `RemoteNewer` | fetch when the session is at least ReadOnly, otherwise relay ciphertext |
//! | `LocalNewer` | offer when the session is at least ReadWrite, otherwise wait for the peer to fetch |
//! | `Conflict` | writers resolve (winner plus conflict copy); others take the winner only |
//! | `Identical` | nothing |

use serde::{Deserialize, Serialize};

use crate::index::{diff, DeltaKind, SummaryEntry};
use crate::secret::Level;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Pull the peer's entry and chunks for a path. With `via_relay` the
    /// session is Encrypted: signed entries and ciphertext only.
    Fetch { target: SummaryEntry, via_relay: bool },
    /// Announce a local entry the peer is missing.
    Offer { entry: SummaryEntry },
    /// Equal revisions, different content. The larger hash keeps the path,
    /// the losing file is preserved as a conflict copy.
    ResolveConflict {
        local: SummaryEntry,
        remote: SummaryEntry,
        remote_wins: bool,
        via_relay: bool,
    },
}

impl Action {
    pub fn path(&self) -> &str {
        match self {
            Action::Fetch { target, .. } => &target.path,
            Action::Offer { entry } => &entry.path,
            Action::ResolveConflict { local, .. } => &local.path,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub actions: Vec<Action>,
    pub identical: usize,
    /// Deltas the session capability does not let this side act on.
    pub skipped: usize,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn fetches(&self) -> impl Iterator<Item = &Action> {
        self.actions
            .iter()
            .filter(|a| matches!(a, Action::Fetch { .. } | Action::ResolveConflict { .. }))
    }
}

pub fn plan(local: &[SummaryEntry], remote: &[SummaryEntry], local_level: Level, effective: Level) -> Plan {
    let via_relay = effective < Level::ReadOnly;
    let mut plan = Plan::default();

    for delta in diff(local, remote) {
        match (delta.kind, delta.local, delta.remote) {
            (DeltaKind::Identical, _, _) => plan.identical += 1,
            (DeltaKind::RemoteNewer, _, Some(target)) => {
                plan.actions.push(Action::Fetch { target, via_relay });
            }
            (DeltaKind::LocalNewer, Some(entry), _) => {
                if effective.can_write() {
                    plan.actions.push(Action::Offer { entry });
                } else {
                    plan.skipped += 1;
                }
            }
            (DeltaKind::Conflict, Some(local), Some(remote)) => {
                let remote_wins = remote.content_hash > local.content_hash;
                if local_level.can_write() {
                    plan.actions.push(Action::ResolveConflict {
                        local,
                        remote,
                        remote_wins,
                        via_relay,
                    });
                } else if remote_wins {
                    plan.actions.push(Action::Fetch {
                        target: remote,
                        via_relay,
                    });
                } else {
                    plan.skipped += 1;
                }
            }
            _ => plan.skipped += 1,
        }
    }
    plan
}
