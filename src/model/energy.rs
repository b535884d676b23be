//! HP-model energy evaluation.
//!
//! The energy of a feasible fold is the negative count of H-H topological
//! contacts: residue pairs (i, j) with j >= i + 2, both hydrophobic, whose
//! lattice positions are Manhattan-adjacent. Chain neighbors never count.
//! A self-intersecting fold has energy `f64::INFINITY`.

use std::collections::HashSet;

use super::conformation::{LatticePoint, Residue};

/// Counts H-H lattice contacts between chain-non-adjacent residues.
///
/// Assumes `positions` came from a self-avoiding walk; call
/// `evaluate_energy` if feasibility is not already known.
pub fn contact_count(sequence: &[Residue], positions: &[LatticePoint]) -> u32 {
    let mut contacts = 0;
    for i in 0..positions.len() {
        if !sequence[i].is_hydrophobic() {
            continue;
        }
        for j in (i + 2)..positions.len() {
            if !sequence[j].is_hydrophobic() {
                continue;
            }
            let (xi, yi) = positions[i];
            let (xj, yj) = positions[j];
            if (xi - xj).abs() + (yi - yj).abs() == 1 {
                contacts += 1;
            }
        }
    }
    contacts
}

/// Evaluates the energy of a fold, returning `f64::INFINITY` for
/// self-intersecting walks.
pub fn evaluate_energy(sequence: &[Residue], positions: &[LatticePoint]) -> f64 {
    let mut seen = HashSet::with_capacity(positions.len());
    for p in positions {
        if !seen.insert(*p) {
            return f64::INFINITY;
        }
    }
    -f64::from(contact_count(sequence, positions))
}
