use crate::model::Competitor;

/// Ranked roster snapshot, fastest elapsed time first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    ranked: Vec<Competitor>,
}

impl Registry {
    /// Builds a ranked registry. Duplicate numbers keep the first row seen.
    pub fn new(mut competitors: Vec<Competitor>) -> Self {
        let mut seen = std::collections::HashSet::new();
        competitors.retain(|c| seen.insert(c.number));
        competitors.sort_by(|a, b| a.rank_cmp(b));
        Self { ranked: competitors }
    }

    pub fn ranked(&self) -> &[Competitor] {
        &self.ranked
    }

    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }

    pub fn get(&self, number: u32) -> Option<&Competitor> {
        self.ranked.iter().find(|c| c.number == number)
    }

    pub fn contains(&self, number: u32) -> bool {
        self.get(number).is_some()
    }

    /// 1-based rank of a competitor.
    pub fn rank_of(&self, number: u32) -> Option<usize> {
        self.ranked.iter().position(|c| c.number == number).map(|i| i + 1)
    }
}
