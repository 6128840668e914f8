//! Skeletal armature evaluation: rest pose propagation, pose solving, B-Bone curves and
//! skinning of attached geometry.
//!
//! This crate does no scheduling, file I/O or constraint math of its own. Constraint, IK
//! and spline IK evaluation plug in through [`ConstraintSolver`] and [`ChainSolver`].

#![forbid(unsafe_code)]

mod dual_quat;
mod error;
mod geometry;
mod model;
mod rest;
mod roll;
mod rotation;
mod runtime;

pub use dual_quat::*;
pub use error::*;
pub use geometry::{cubic_tangent_factor_circle, invert_or_identity, is_negative_mat4, mat4_to_size, normalize_mat4};
pub use model::*;
pub use rest::*;
pub use roll::*;
pub use rotation::*;
pub use runtime::*;

#[cfg(test)]
mod geometry_tests;
