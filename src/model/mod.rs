//! HP-lattice conformation model.
//!
//! This module defines the pure data types for the HP model:
//!
//! - `Residue`: hydrophobic (H) or polar (P) monomer
//! - `Direction`: a step on the 2D integer lattice
//! - `Conformation`: a candidate fold with derived coordinates and energy
//!
//! Energy evaluation and move-sequence folding are free functions shared by
//! every solver. Nothing in this module performs I/O.

pub mod conformation;
pub mod energy;

pub use conformation::{fold_positions, Conformation, Direction, LatticePoint, Residue, DIRECTIONS};
pub use energy::{contact_count, evaluate_energy};
