//! Typed constraint bitset.
//!
//! Each precondition a job can declare maps to one [`Constraint`]. A
//! [`ConstraintSet`] is a small copyable bitset over them; records keep one
//! set for what they require and one for what is currently satisfied.

use std::fmt;

use crate::types::NetworkType;

/// A single named precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Constraint {
    Charging = 0,
    Idle = 1,
    BatteryNotLow = 2,
    StorageNotLow = 3,
    AnyNetwork = 4,
    UnmeteredNetwork = 5,
    NotRoamingNetwork = 6,
    MeteredNetwork = 7,
    /// An earliest-run bound is present.
    TimingDelay = 8,
    /// A latest-run bound is present.
    Deadline = 9,
    ContentTrigger = 10,
}

impl Constraint {
    pub const ALL: [Constraint; 11] = [
        Constraint::Charging,
        Constraint::Idle,
        Constraint::BatteryNotLow,
        Constraint::StorageNotLow,
        Constraint::AnyNetwork,
        Constraint::UnmeteredNetwork,
        Constraint::NotRoamingNetwork,
        Constraint::MeteredNetwork,
        Constraint::TimingDelay,
        Constraint::Deadline,
        Constraint::ContentTrigger,
    ];

    const fn bit(self) -> u16 {
        1 << (self as u8)
    }

    /// The constraint bit for a network requirement, if any.
    pub fn for_network(network: NetworkType) -> Option<Constraint> {
        match network {
            NetworkType::None => None,
            NetworkType::Any => Some(Constraint::AnyNetwork),
            NetworkType::Unmetered => Some(Constraint::UnmeteredNetwork),
            NetworkType::NotRoaming => Some(Constraint::NotRoamingNetwork),
            NetworkType::Metered => Some(Constraint::MeteredNetwork),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Constraint::Charging => "charging",
            Constraint::Idle => "idle",
            Constraint::BatteryNotLow => "battery_not_low",
            Constraint::StorageNotLow => "storage_not_low",
            Constraint::AnyNetwork => "any_network",
            Constraint::UnmeteredNetwork => "unmetered_network",
            Constraint::NotRoamingNetwork => "not_roaming_network",
            Constraint::MeteredNetwork => "metered_network",
            Constraint::TimingDelay => "timing_delay",
            Constraint::Deadline => "deadline",
            Constraint::ContentTrigger => "content_trigger",
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bitset of [`Constraint`]s.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConstraintSet(u16);

impl ConstraintSet {
    pub const EMPTY: ConstraintSet = ConstraintSet(0);

    /// Constraints reported by environment observers rather than by the clock.
    pub const ENVIRONMENT: ConstraintSet = ConstraintSet::of(&[
        Constraint::Charging,
        Constraint::Idle,
        Constraint::BatteryNotLow,
        Constraint::StorageNotLow,
        Constraint::AnyNetwork,
        Constraint::UnmeteredNetwork,
        Constraint::NotRoamingNetwork,
        Constraint::MeteredNetwork,
        Constraint::ContentTrigger,
    ]);

    /// Satisfaction bits a rescheduled record inherits from its predecessor.
    ///
    /// Environment state minus content triggers, whose bookkeeping restarts
    /// with every new record.
    pub const CARRIED_ON_RESCHEDULE: ConstraintSet = ConstraintSet::of(&[
        Constraint::Charging,
        Constraint::Idle,
        Constraint::BatteryNotLow,
        Constraint::StorageNotLow,
        Constraint::AnyNetwork,
        Constraint::UnmeteredNetwork,
        Constraint::NotRoamingNetwork,
        Constraint::MeteredNetwork,
    ]);

    /// Constraints left out of ordinary readiness.
    ///
    /// The deadline never has to be met for a job to be ready; for one-off
    /// jobs it is instead an alternative path to readiness.
    pub const NOT_OF_INTEREST: ConstraintSet = ConstraintSet::of(&[Constraint::Deadline]);

    pub const fn of(constraints: &[Constraint]) -> ConstraintSet {
        let mut bits = 0;
        let mut i = 0;
        while i < constraints.len() {
            bits |= constraints[i].bit();
            i += 1;
        }
        ConstraintSet(bits)
    }

    pub fn contains(&self, constraint: Constraint) -> bool {
        self.0 & constraint.bit() != 0
    }

    pub fn insert(&mut self, constraint: Constraint) {
        self.0 |= constraint.bit();
    }

    pub fn remove(&mut self, constraint: Constraint) {
        self.0 &= !constraint.bit();
    }

    /// Set or clear `constraint`, returning whether the set changed.
    pub fn set(&mut self, constraint: Constraint, state: bool) -> bool {
        let before = self.0;
        if state {
            self.insert(constraint);
        } else {
            self.remove(constraint);
        }
        before != self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_subset(&self, other: ConstraintSet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn intersection(&self, other: ConstraintSet) -> ConstraintSet {
        ConstraintSet(self.0 & other.0)
    }

    pub fn difference(&self, other: ConstraintSet) -> ConstraintSet {
        ConstraintSet(self.0 & !other.0)
    }

    pub fn union(&self, other: ConstraintSet) -> ConstraintSet {
        ConstraintSet(self.0 | other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = Constraint> + '_ {
        Constraint::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl FromIterator<Constraint> for ConstraintSet {
    fn from_iter<I: IntoIterator<Item = Constraint>>(iter: I) -> Self {
        let mut set = ConstraintSet::EMPTY;
        for constraint in iter {
            set.insert(constraint);
        }
        set
    }
}

impl fmt::Debug for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|c| c.name()).collect();
        write!(f, "{}", names.join(","))
    }
}
