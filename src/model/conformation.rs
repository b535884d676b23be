//! Conformation data types: residues, lattice directions, and folds.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

use super::energy::evaluate_energy;

/// A single monomer in the HP model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Residue {
    /// Hydrophobic residue; only H-H lattice contacts contribute energy.
    H,
    /// Polar residue; contributes no interaction energy.
    P,
}

impl Residue {
    /// Parses a residue from its one-letter code.
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'H' => Some(Residue::H),
            'P' => Some(Residue::P),
            _ => None,
        }
    }

    /// Returns whether this residue is hydrophobic.
    pub fn is_hydrophobic(self) -> bool {
        matches!(self, Residue::H)
    }
}

/// Parses an HP sequence string, rejecting anything outside {H, P}.
///
/// # Errors
///
/// Returns `ValidationError::SequenceTooShort` for sequences of fewer than
/// two residues and `ValidationError::InvalidResidue` for unknown symbols.
pub fn parse_sequence(sequence: &str) -> Result<Vec<Residue>, ValidationError> {
    if sequence.len() < 2 {
        return Err(ValidationError::SequenceTooShort {
            length: sequence.len(),
        });
    }
    sequence
        .chars()
        .map(|c| Residue::from_char(c).ok_or(ValidationError::InvalidResidue { symbol: c }))
        .collect()
}

/// A unit step on the 2D integer lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// (0, 1)
    Up,
    /// (0, -1)
    Down,
    /// (-1, 0)
    Left,
    /// (1, 0)
    Right,
}

/// All lattice directions, in a fixed order for reproducible sampling.
pub const DIRECTIONS: [Direction; 4] = [
    Direction::Up,
    Direction::Down,
    Direction::Left,
    Direction::Right,
];

impl Direction {
    /// Returns the lattice vector for this direction.
    pub fn vector(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, 1),
            Direction::Down => (0, -1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }

    /// Parses a direction from its one-letter code (U/D/L/R).
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'U' => Some(Direction::Up),
            'D' => Some(Direction::Down),
            'L' => Some(Direction::Left),
            'R' => Some(Direction::Right),
            _ => None,
        }
    }

    /// One-letter code for this direction.
    pub fn as_char(self) -> char {
        match self {
            Direction::Up => 'U',
            Direction::Down => 'D',
            Direction::Left => 'L',
            Direction::Right => 'R',
        }
    }
}

/// A point on the 2D integer lattice.
pub type LatticePoint = (i32, i32);

/// Derives residue coordinates from a move sequence.
///
/// `positions[0]` is fixed at the origin; each subsequent residue is placed
/// one lattice step from its predecessor. The result always has
/// `moves.len() + 1` entries, whether or not the walk self-intersects.
pub fn fold_positions(moves: &[Direction]) -> Vec<LatticePoint> {
    let mut positions = Vec::with_capacity(moves.len() + 1);
    let mut current = (0i32, 0i32);
    positions.push(current);
    for m in moves {
        let (dx, dy) = m.vector();
        current = (current.0 + dx, current.1 + dy);
        positions.push(current);
    }
    positions
}

/// A candidate fold: sequence, move list, derived coordinates, and energy.
///
/// A conformation whose walk revisits a lattice site is infeasible; its
/// energy is `f64::INFINITY` so it compares worse than any feasible fold but
/// is never reported as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conformation {
    /// The residue sequence this fold belongs to.
    pub sequence: Vec<Residue>,
    /// Lattice steps; always `sequence.len() - 1` entries.
    pub moves: Vec<Direction>,
    /// Derived coordinates, `positions[0] == (0, 0)`.
    pub positions: Vec<LatticePoint>,
    /// H-H contact energy, or `f64::INFINITY` if self-intersecting.
    pub energy: f64,
}

impl Conformation {
    /// Builds a conformation from a sequence and move list, deriving
    /// positions and energy.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MoveCountMismatch` when the move list does
    /// not have exactly `sequence.len() - 1` entries.
    pub fn new(sequence: Vec<Residue>, moves: Vec<Direction>) -> Result<Self, ValidationError> {
        if moves.len() + 1 != sequence.len() {
            return Err(ValidationError::MoveCountMismatch {
                expected: sequence.len().saturating_sub(1),
                actual: moves.len(),
            });
        }
        let positions = fold_positions(&moves);
        let energy = evaluate_energy(&sequence, &positions);
        Ok(Self {
            sequence,
            moves,
            positions,
            energy,
        })
    }

    /// Rebuilds positions and energy after the move list was mutated in
    /// place. Used by solver loops to avoid re-validating lengths.
    pub fn refold(&mut self) {
        self.positions = fold_positions(&self.moves);
        self.energy = evaluate_energy(&self.sequence, &self.positions);
    }

    /// Returns whether the fold is a self-avoiding walk.
    pub fn is_feasible(&self) -> bool {
        self.energy.is_finite()
    }

    /// Renders the move list as a compact string (e.g. "URRD").
    pub fn moves_string(&self) -> String {
        self.moves.iter().map(|m| m.as_char()).collect()
    }
}
