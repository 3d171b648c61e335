//! Election result cache.
//!
//! Mirrors the ELECT/UN_ELECT events of a pool's log so a winner can be
//! looked up without scanning the history. The first candidate the pool
//! processes for a label wins; there is no tie-break on request contents.

use crate::types::Identity;
use std::collections::BTreeMap;

/// Outcome of an election request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectOutcome {
    /// The candidate won and an ELECT event must be recorded
    Won(Identity),
    /// An earlier candidate already holds the label
    Existing(Identity),
}

/// Label to winner map of all unresolved elections
#[derive(Debug, Default)]
pub struct ElectionSet {
    winners: BTreeMap<String, Identity>,
}

impl ElectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, label: &str) -> Option<&Identity> {
        self.winners.get(label)
    }

    pub fn len(&self) -> usize {
        self.winners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.winners.is_empty()
    }

    /// Elect `candidate` unless the label already has a winner
    pub fn elect(&mut self, label: &str, candidate: &Identity) -> ElectOutcome {
        match self.winners.get(label) {
            Some(winner) => ElectOutcome::Existing(winner.clone()),
            None => {
                self.winners.insert(label.to_string(), candidate.clone());
                ElectOutcome::Won(candidate.clone())
            }
        }
    }

    /// Clear every election won by `identity`, returning the freed labels
    pub fn remove_won_by(&mut self, identity: &Identity) -> Vec<String> {
        let labels: Vec<String> = self
            .winners
            .iter()
            .filter(|(_, winner)| *winner == identity)
            .map(|(label, _)| label.clone())
            .collect();

        for label in &labels {
            self.winners.remove(label);
        }
        labels
    }

    /// Copy of the current results, ordered by label
    pub fn snapshot(&self) -> Vec<(String, Identity)> {
        self.winners
            .iter()
            .map(|(label, winner)| (label.clone(), winner.clone()))
            .collect()
    }
}
