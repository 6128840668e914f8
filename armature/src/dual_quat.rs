//! Dual quaternions with an optional scale matrix, the blend representation used by
//! quaternion skinning.
//!
//! `real` holds the rotation, `dual` the translation encoded as `0.5 * t * real`.
//! Bones with non-rigid pose matrices carry their scale separately in `scale`
//! (an object-space matrix around the rest pose) with `scale_weight` tracking how
//! much of the accumulated sum actually contributed scale.

use crate::geometry::{
    invert_or_identity, is_negative_mat4, is_orthonormal_mat3, mat3_to_quat, mat4_to_size,
    orthogonalize_mat3_y,
};
use glam::{Mat3, Mat4, Quat, Vec3, Vec4};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DualQuat {
    pub real: Quat,
    pub dual: Quat,
    pub scale: Mat4,
    pub scale_weight: f32,
}

impl Default for DualQuat {
    fn default() -> Self {
        Self::ZERO
    }
}

impl DualQuat {
    /// Accumulator start value.
    pub const ZERO: Self = Self {
        real: Quat::from_xyzw(0.0, 0.0, 0.0, 0.0),
        dual: Quat::from_xyzw(0.0, 0.0, 0.0, 0.0),
        scale: Mat4::ZERO,
        scale_weight: 0.0,
    };

    pub const IDENTITY: Self = Self {
        real: Quat::IDENTITY,
        dual: Quat::from_xyzw(0.0, 0.0, 0.0, 0.0),
        scale: Mat4::ZERO,
        scale_weight: 0.0,
    };

    /// Rigid transform from a rotation and translation.
    pub fn from_rotation_translation(rotation: Quat, translation: Vec3) -> Self {
        Self {
            real: rotation,
            dual: translation_dual(rotation, translation),
            scale: Mat4::ZERO,
            scale_weight: 0.0,
        }
    }

    /// Converts the deform matrix `mat` (pose * inverse(rest)) of a bone whose rest matrix
    /// is `base` into a dual quaternion. Scale and shear are split off into `scale` so that
    /// only the rigid part gets blended as a quaternion.
    pub fn from_deform_matrix(base: &Mat4, mat: &Mat4) -> Self {
        let base_rs = *mat * *base;
        let dscale = mat4_to_size(&base_rs) - Vec3::ONE;

        let (rigid, scale, scale_weight) = if !is_orthonormal_mat3(&Mat3::from_mat4(*mat))
            || is_negative_mat4(mat)
            || dscale.length_squared() > 1.0e-4 * 1.0e-4
        {
            // Orthogonalize around Y so stretched bones do not flip.
            let rotation = mat3_to_quat(&orthogonalize_mat3_y(&Mat3::from_mat4(base_rs)));
            let mut base_r = Mat4::from_quat(rotation);
            base_r.w_axis = base_rs.w_axis;

            let base_inv = invert_or_identity(base);
            let rigid = base_r * base_inv;
            let s = invert_or_identity(&base_r) * base_rs;
            (rigid, *base * s * base_inv, 1.0)
        } else {
            (*mat, Mat4::ZERO, 0.0)
        };

        let real = mat3_to_quat(&Mat3::from_mat4(rigid));
        Self {
            real,
            dual: translation_dual(real, rigid.w_axis.truncate()),
            scale,
            scale_weight,
        }
    }

    /// Adds `weight * other` to this accumulator, flipping the sign of `other` when it lies
    /// in the opposite hemisphere so rotations interpolate along the short arc.
    pub fn add_weighted(&mut self, other: &DualQuat, weight: f32) {
        let mut weight = weight;
        let flipped = self.real.dot(other.real) < 0.0;
        if flipped {
            weight = -weight;
        }

        self.real = self.real + other.real * weight;
        self.dual = self.dual + other.dual * weight;

        if other.scale_weight != 0.0 {
            // Scale never takes negative weights.
            if flipped {
                weight = -weight;
            }
            self.scale = self.scale + other.scale * weight;
            self.scale_weight += weight;
        }
    }

    /// Divides the accumulated sum by the total contribution. Parts of the sum that carried
    /// no scale are filled with identity before averaging.
    pub fn normalize_by(&mut self, total_weight: f32) {
        let scale = 1.0 / total_weight;
        self.real = self.real * scale;
        self.dual = self.dual * scale;

        if self.scale_weight != 0.0 {
            let add_weight = total_weight - self.scale_weight;
            if add_weight != 0.0 {
                self.scale = self.scale + Mat4::from_diagonal(Vec4::splat(add_weight));
            }
            self.scale = self.scale * scale;
            self.scale_weight = 1.0;
        }
    }

    /// Rotation part as a 3x3 matrix, built from the (possibly non-unit) `real` quaternion.
    /// The caller divides by `|real|^2`.
    fn rotation_matrix(&self) -> Mat3 {
        let (x, y, z, w) = (self.real.x, self.real.y, self.real.z, self.real.w);
        Mat3::from_cols(
            Vec3::new(
                w * w + x * x - y * y - z * z,
                2.0 * (x * y + w * z),
                2.0 * (x * z - w * y),
            ),
            Vec3::new(
                2.0 * (x * y - w * z),
                w * w + y * y - x * x - z * z,
                2.0 * (y * z + w * x),
            ),
            Vec3::new(
                2.0 * (x * z + w * y),
                2.0 * (y * z - w * x),
                w * w + z * z - x * x - y * y,
            ),
        )
    }

    /// Transforms a point. Also returns the 3x3 deformation matrix (rotation times scale)
    /// for callers tracking per-vertex deformation.
    pub fn transform_point(&self, co: Vec3) -> (Vec3, Mat3) {
        let (x, y, z, w) = (self.real.x, self.real.y, self.real.z, self.real.w);
        let (t0, t1, t2, t3) = (self.dual.w, self.dual.x, self.dual.y, self.dual.z);

        let m = self.rotation_matrix();
        let mut len2 = self.real.length_squared();
        if len2 > 0.0 {
            len2 = 1.0 / len2;
        }

        let t = Vec3::new(
            2.0 * (-t0 * x + w * t1 - t2 * z + y * t3),
            2.0 * (-t0 * y + t1 * z - x * t3 + w * t2),
            2.0 * (-t0 * z + x * t2 + w * t3 - t1 * y),
        );

        let mut co = co;
        if self.scale_weight != 0.0 {
            co = self.scale.transform_point3(co);
        }
        let out = (m * co + t) * len2;

        let defmat = if self.scale_weight != 0.0 {
            m * Mat3::from_mat4(self.scale)
        } else {
            m
        };
        (out, defmat * len2)
    }
}

/// `0.5 * t * q` with `t` as a pure quaternion.
fn translation_dual(q: Quat, t: Vec3) -> Quat {
    Quat::from_xyzw(
        0.5 * (t.x * q.w + t.y * q.z - t.z * q.y),
        0.5 * (-t.x * q.z + t.y * q.w + t.z * q.x),
        0.5 * (t.x * q.y - t.y * q.x + t.z * q.w),
        -0.5 * (t.x * q.x + t.y * q.y + t.z * q.z),
    )
}
