//! Bone direction + roll <-> rest basis.
//!
//! The basis maps +Y onto the bone direction along the straightest path, then rolls X/Z
//! around it. The general closed form degenerates when the direction approaches -Y, so
//! a renormalized limit is used close to it and a fixed 180° turn about Z at exactly -Y.

use glam::{Mat3, Vec3};

const THETA_THRESHOLD_NEGY: f32 = 1.0e-9;
const THETA_THRESHOLD_NEGY_CLOSE: f32 = 1.0e-5;

/// Rest basis for a bone pointing along `direction` (any length) with `roll` radians.
///
/// A zero `direction` has no meaning; it is treated as +Y.
pub fn vec_roll_to_mat3(direction: Vec3, roll: f32) -> Mat3 {
    let nor = match direction.try_normalize() {
        Some(nor) => nor,
        None => {
            log::trace!("zero-length direction, using +Y");
            Vec3::Y
        }
    };
    vec_roll_to_mat3_normalized(nor, roll)
}

/// Same as [`vec_roll_to_mat3`] for an already unit-length `nor`.
pub fn vec_roll_to_mat3_normalized(nor: Vec3, roll: f32) -> Mat3 {
    let (x, y, z) = (nor.x, nor.y, nor.z);
    let theta = 1.0 + y;

    let bone = if theta > THETA_THRESHOLD_NEGY_CLOSE
        || ((x != 0.0 || z != 0.0) && theta > THETA_THRESHOLD_NEGY)
    {
        let (xx, zz, xz) = if theta > THETA_THRESHOLD_NEGY_CLOSE {
            (1.0 - x * x / theta, 1.0 - z * z / theta, -x * z / theta)
        } else {
            // Close to -Y: drop the 1 / (1 + y) factor and renormalize instead.
            let theta = x * x + z * z;
            let xx = (x + z) * (x - z) / -theta;
            (xx, -xx, 2.0 * x * z / theta)
        };
        Mat3::from_cols(
            Vec3::new(xx, -x, xz),
            Vec3::new(x, y, z),
            Vec3::new(xz, -z, zz),
        )
    } else {
        Mat3::from_diagonal(Vec3::new(-1.0, -1.0, 1.0))
    };

    Mat3::from_axis_angle(nor, roll) * bone
}

/// Direction (Y column) and roll of a pure rotation matrix.
pub fn mat3_to_vec_roll(m: &Mat3) -> (Vec3, f32) {
    let vec = m.y_axis;
    (vec, mat3_vec_to_roll(m, vec))
}

/// Roll around `vec` that best approximates `m`. Exact when `vec` is the Y column of a
/// pure rotation.
pub fn mat3_vec_to_roll(m: &Mat3, vec: Vec3) -> f32 {
    let vec_mat = vec_roll_to_mat3(vec, 0.0);
    let roll_mat = crate::geometry::invert_mat3_or_identity(&vec_mat) * *m;
    roll_mat.z_axis.x.atan2(roll_mat.z_axis.z)
}
