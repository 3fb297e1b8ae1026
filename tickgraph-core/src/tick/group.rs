//! Tick groups: the totally ordered phases of a frame.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A per-frame update phase.
///
/// Groups run in declaration order. `StartPhysics` and `EndPhysics` are
/// hard sync points with an external simulation and never receive work that
/// dependency resolution pushed later than its declared group.
/// `NewlySpawned` is a pseudo-group for work registered after the frame's
/// queueing pass; it cannot be declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum TickGroup {
    #[default]
    PrePhysics,
    StartPhysics,
    DuringPhysics,
    EndPhysics,
    PostPhysics,
    PostUpdateWork,
    LastDemotable,
    NewlySpawned,
}

impl TickGroup {
    pub const COUNT: usize = 8;

    pub const ALL: [TickGroup; TickGroup::COUNT] = [
        TickGroup::PrePhysics,
        TickGroup::StartPhysics,
        TickGroup::DuringPhysics,
        TickGroup::EndPhysics,
        TickGroup::PostPhysics,
        TickGroup::PostUpdateWork,
        TickGroup::LastDemotable,
        TickGroup::NewlySpawned,
    ];

    /// Groups a frame driver runs explicitly, in order.
    pub const DRIVEN: [TickGroup; TickGroup::COUNT - 1] = [
        TickGroup::PrePhysics,
        TickGroup::StartPhysics,
        TickGroup::DuringPhysics,
        TickGroup::EndPhysics,
        TickGroup::PostPhysics,
        TickGroup::PostUpdateWork,
        TickGroup::LastDemotable,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// The following group, or `None` for the ceiling.
    pub fn next(self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    /// Whether resolution may move work into this group from an earlier one.
    pub fn can_host_demoted(self) -> bool {
        !matches!(self, TickGroup::StartPhysics | TickGroup::EndPhysics)
    }

    /// The first group at or after `self` that can host demoted work.
    pub fn demoted(self) -> Self {
        let mut group = self;
        while !group.can_host_demoted() {
            match group.next() {
                Some(next) => group = next,
                None => break,
            }
        }
        group
    }

    /// Whether a frame driver waits for this group by default.
    ///
    /// `DuringPhysics` overlaps the external simulation, so drivers let it run
    /// on while they move on to `EndPhysics`.
    pub fn blocks_by_default(self) -> bool {
        self != TickGroup::DuringPhysics
    }

    pub fn name(self) -> &'static str {
        match self {
            TickGroup::PrePhysics => "PrePhysics",
            TickGroup::StartPhysics => "StartPhysics",
            TickGroup::DuringPhysics => "DuringPhysics",
            TickGroup::EndPhysics => "EndPhysics",
            TickGroup::PostPhysics => "PostPhysics",
            TickGroup::PostUpdateWork => "PostUpdateWork",
            TickGroup::LastDemotable => "LastDemotable",
            TickGroup::NewlySpawned => "NewlySpawned",
        }
    }

    /// Inclusive range of groups.
    pub fn range(first: TickGroup, last: TickGroup) -> impl Iterator<Item = TickGroup> {
        Self::ALL[first.index()..=last.index().max(first.index())]
            .iter()
            .copied()
            .filter(move |group| *group <= last)
    }
}

impl fmt::Display for TickGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
