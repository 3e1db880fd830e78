// SPDX-License-Identifier: AGPL-3.0-or-later
#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::many_single_char_names,
    clippy::too_many_arguments,
    clippy::similar_names
)]
//! wetSpring Canopy — phylogenetic likelihood evaluation engine.
//!
//! Evaluates the probability of molecular sequence data given a tree, a
//! continuous-time Markov substitution model on a finite alphabet, and a
//! discrete distribution of among-site rate variation. The consumer is an
//! inference engine (ML optimizer or Bayesian sampler) that proposes
//! changes to topology, branch lengths, or model parameters and needs fast
//! incremental re-evaluation: the caller owns all buffer indices, so a
//! rejected proposal is rolled back by simply reusing the previous index.
//!
//! # Structure
//!
//! - [`resource`] — registry of computational resources (CPU scalar, CPU
//!   SSE, f64-capable GPUs) with capability [`flags`]
//! - [`engine`] — procedural boundary: integer handles over a global
//!   instance table
//! - [`Instance`] — the same surface for direct embedding
//! - `backend` — the kernel engines; scalar CPU is the reference, the
//!   vectorized CPU and wgpu f64 GPU (`feature = "gpu"`) engines agree
//!   with it within [`tolerances`]
//! - [`ops`] — the peel operation-list format and ordering contract
//!
//! # Kernels
//!
//! 1. Transition matrices `exp(Q·t·r_c)` from an eigen-decomposition
//! 2. Felsenstein peeling over a caller-submitted operation list
//! 3. Root integration to per-pattern site log-likelihoods
//! 4. Edge integration with first/second branch-length derivatives
//!
//! Underflow on deep trees is handled by per-pattern rescaling with log
//! scalers accumulated at integration (`rescale` flag on
//! [`engine::update_partials`]).
//!
//! # References
//!
//! - Felsenstein 1981, *J Mol Evol* 17:368-376
//! - Yang 1994, *J Mol Evol* 39:306-314
//! - Suchard & Rambaut 2009, *Bioinformatics* 25:1370-1376

mod backend;
mod buffers;
pub mod engine;
pub mod error;
pub mod flags;
mod instance;
pub mod ops;
pub mod resource;
pub mod sizing;
pub mod tolerances;
pub mod validation;

pub use error::{Error, Result};
pub use flags::Flags;
pub use instance::{Instance, InstanceDetails};
pub use sizing::InstanceSizing;
