use super::Candidate;

/// Gateway candidates collected during one discovery window.
///
/// Keeps discovery order; duplicates are kept and scored independently.
#[derive(Debug, Default, Clone)]
pub struct CandidateRegistry {
    candidates: Vec<Candidate>,
}

impl CandidateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: Candidate) {
        self.candidates.push(candidate);
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Copy of the candidates in discovery order
    pub fn snapshot(&self) -> Vec<Candidate> {
        self.candidates.clone()
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
    }
}
