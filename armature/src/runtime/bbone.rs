//! B-Bones: bones bent into a cubic Bezier and split into equal-length segments.
//!
//! The curve lives in the bone's own space, from `(0, 0, 0)` to `(0, length, 0)`. Its
//! handles come from neighboring bones (see [`BBoneHandleType`]) plus the shape offsets
//! stored on the bone and animated on the channel.

use crate::geometry::{
    cubic_tangent_factor_circle, forward_diff_bezier, invert_or_identity, mat4_from_mat3_translation,
    mat4_to_size, normalize_mat4,
};
use crate::roll::{mat3_vec_to_roll, vec_roll_to_mat3};
use crate::{Armature, BBoneHandleType, BBoneShape, BoneFlags, DualQuat, Pose};
use glam::{Mat3, Mat4, Vec3};
use std::sync::Arc;

pub const MAX_BBONE_SUBDIVISIONS: usize = 32;

/// Blend factor for the inner roll control points, matching circular roll interpolation.
const ROLL_BEZIER_BLEND: f32 = 0.390464;

/// Everything the spline needs for one bone, gathered per evaluation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BBoneSplineParameters {
    pub segments: usize,
    pub length: f32,

    /// Set when the pose matrix scales non-uniformly.
    pub do_scale: bool,
    pub scale: Vec3,

    pub use_prev: bool,
    pub use_next: bool,
    pub prev_bbone: bool,
    pub next_bbone: bool,

    /// Handle points in this bone's space.
    pub prev_h: Vec3,
    pub next_h: Vec3,
    /// Neighbor matrices in this bone's space, for roll.
    pub prev_mat: Mat4,
    pub next_mat: Mat4,

    pub ease1: f32,
    pub ease2: f32,
    pub roll1: f32,
    pub roll2: f32,
    pub scale_in: f32,
    pub scale_out: f32,
    pub curve_in_x: f32,
    pub curve_in_y: f32,
    pub curve_out_x: f32,
    pub curve_out_y: f32,
}

impl Default for BBoneSplineParameters {
    fn default() -> Self {
        Self {
            segments: 1,
            length: 0.0,
            do_scale: false,
            scale: Vec3::ONE,
            use_prev: false,
            use_next: false,
            prev_bbone: false,
            next_bbone: false,
            prev_h: Vec3::ZERO,
            next_h: Vec3::ZERO,
            prev_mat: Mat4::IDENTITY,
            next_mat: Mat4::IDENTITY,
            ease1: 0.0,
            ease2: 0.0,
            roll1: 0.0,
            roll2: 0.0,
            scale_in: 1.0,
            scale_out: 1.0,
            curve_in_x: 0.0,
            curve_in_y: 0.0,
            curve_out_x: 0.0,
            curve_out_y: 0.0,
        }
    }
}

/// Bezier handle vectors relative to the curve ends, and the roll at each end.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BBoneHandles {
    pub h1: Vec3,
    pub roll1: f32,
    pub h2: Vec3,
    pub roll2: f32,
}

/// Deform matrices of a B-Bone: `mats[0]` maps armature space into the bone's rest space,
/// `mats[a + 1]` deforms points of segment `a`. Shared read-only with deform caches.
#[derive(Clone, Debug, PartialEq)]
pub struct BBoneDeform {
    pub mats: Vec<Mat4>,
    pub dual_quats: Vec<DualQuat>,
}

impl BBoneDeform {
    pub fn segments(&self) -> usize {
        self.dual_quats.len()
    }

    /// Segment covering `co` (armature space) along the bone's rest Y axis. Points past
    /// either end use the end segment.
    pub fn segment_index(&self, co: Vec3, bone_length: f32) -> usize {
        let segments = self.segments();
        if segments == 0 {
            return 0;
        }
        let y = self.mats[0].transform_point3(co).y;
        let segment_length = bone_length / segments as f32;
        let index = (y / segment_length) as i64;
        index.clamp(0, segments as i64 - 1) as usize
    }
}

/// Runtime B-Bone state of a pose channel.
#[derive(Clone, Debug, PartialEq)]
pub struct BBoneCache {
    rest: Vec<Mat4>,
    pose: Vec<Mat4>,
    deform: Arc<BBoneDeform>,
}

impl BBoneCache {
    pub fn segments(&self) -> usize {
        self.pose.len()
    }

    /// Segment matrices of the rest shape, in bone space.
    pub fn rest_segments(&self) -> &[Mat4] {
        &self.rest
    }

    /// Segment matrices of the posed shape, in bone space.
    pub fn pose_segments(&self) -> &[Mat4] {
        &self.pose
    }

    pub fn deform(&self) -> &Arc<BBoneDeform> {
        &self.deform
    }
}

impl Pose {
    /// Previous and next handle channels of a B-Bone.
    pub fn bbone_handles(&self, armature: &Armature, index: usize) -> (Option<usize>, Option<usize>) {
        let (Some(bone), Some(channel)) = (armature.bone(index), self.channel(index)) else {
            return (None, None);
        };

        let prev = match bone.bbone_prev_type {
            BBoneHandleType::Auto if bone.flags.contains(BoneFlags::CONNECTED) => channel.parent(),
            BBoneHandleType::Auto => None,
            _ => channel.bbone_prev(),
        };
        let next = match bone.bbone_next_type {
            BBoneHandleType::Auto => channel.child(),
            _ => channel.bbone_next(),
        };
        (prev, next)
    }

    /// Spline parameters of channel `index`, either for the rest shape or the current pose.
    pub fn bbone_spline_params(&self, armature: &Armature, index: usize, rest: bool) -> BBoneSplineParameters {
        let mut param = BBoneSplineParameters::default();
        let (Some(bone), Some(channel)) = (armature.bone(index), self.channel(index)) else {
            return param;
        };

        param.segments = bone.segments.max(1) as usize;
        param.length = bone.length();

        if !rest {
            let scale = mat4_to_size(&channel.pose_mat());
            if (scale.x - scale.y).abs() > 1.0e-6 || (scale.y - scale.z).abs() > 1.0e-6 {
                param.do_scale = true;
                param.scale = scale;
            }
        }

        let (prev, next) = self.bbone_handles(armature, index);

        let imat = if rest {
            invert_or_identity(&bone.arm_mat())
        } else if param.do_scale {
            invert_or_identity(&normalize_mat4(&channel.pose_mat()))
        } else {
            invert_or_identity(&channel.pose_mat())
        };

        let neighbor = |i: usize| Some((armature.bone(i)?, self.channel(i)?));

        if let Some((prev_bone, prev_channel)) = prev.and_then(neighbor) {
            param.use_prev = true;

            let h1 = match bone.bbone_prev_type {
                BBoneHandleType::Relative if rest => None,
                BBoneHandleType::Relative => {
                    let delta = prev_channel.pose_head() - prev_bone.arm_head();
                    Some(channel.pose_head() - delta)
                }
                BBoneHandleType::Tangent if rest => {
                    let delta = prev_bone.arm_tail() - prev_bone.arm_head();
                    Some(bone.arm_head() - delta)
                }
                BBoneHandleType::Tangent => {
                    let delta = prev_channel.pose_tail() - prev_channel.pose_head();
                    Some(channel.pose_head() - delta)
                }
                BBoneHandleType::Auto | BBoneHandleType::Absolute => {
                    param.prev_bbone = prev_bone.is_bbone();
                    Some(if rest {
                        prev_bone.arm_head()
                    } else {
                        prev_channel.pose_head()
                    })
                }
            };
            // Relative handles sit on this bone's head at rest.
            param.prev_h = h1.map_or(Vec3::ZERO, |h1| imat.transform_point3(h1));

            if !param.prev_bbone {
                let prev_mat = if rest {
                    prev_bone.arm_mat()
                } else {
                    prev_channel.pose_mat()
                };
                param.prev_mat = imat * prev_mat;
            }
        }

        if let Some((next_bone, next_channel)) = next.and_then(neighbor) {
            param.use_next = true;

            let h2 = match bone.bbone_next_type {
                BBoneHandleType::Relative if rest => None,
                BBoneHandleType::Relative => {
                    let delta = next_channel.pose_head() - next_bone.arm_head();
                    Some(channel.pose_tail() + delta)
                }
                BBoneHandleType::Tangent if rest => {
                    let delta = next_bone.arm_tail() - next_bone.arm_head();
                    Some(bone.arm_tail() + delta)
                }
                BBoneHandleType::Tangent => {
                    let delta = next_channel.pose_tail() - next_channel.pose_head();
                    Some(channel.pose_tail() + delta)
                }
                BBoneHandleType::Auto | BBoneHandleType::Absolute => {
                    param.next_bbone = next_bone.is_bbone();
                    Some(if rest {
                        next_bone.arm_tail()
                    } else {
                        next_channel.pose_tail()
                    })
                }
            };
            param.next_h = h2.map_or(Vec3::new(0.0, param.length, 0.0), |h2| {
                imat.transform_point3(h2)
            });

            let next_mat = if rest {
                next_bone.arm_mat()
            } else {
                next_channel.pose_mat()
            };
            param.next_mat = imat * next_mat;
        }

        let offsets = if rest {
            BBoneShape::OFFSET
        } else {
            channel.bbone
        };

        param.ease1 = bone.bbone.ease_in + offsets.ease_in;
        param.ease2 = bone.bbone.ease_out + offsets.ease_out;
        param.roll1 = bone.bbone.roll_in + offsets.roll_in;
        param.roll2 = bone.bbone.roll_out + offsets.roll_out;

        if bone.flags.contains(BoneFlags::ADD_PARENT_END_ROLL) {
            if let Some((prev_bone, prev_channel)) = prev.and_then(neighbor) {
                param.roll1 += prev_bone.bbone.roll_out;
                if !rest {
                    param.roll1 += prev_channel.bbone.roll_out;
                }
            }
        }

        param.scale_in = bone.bbone.scale_in * offsets.scale_in;
        param.scale_out = bone.bbone.scale_out * offsets.scale_out;

        param.curve_in_x = bone.bbone.curve_in_x + offsets.curve_in_x;
        param.curve_in_y = bone.bbone.curve_in_y + offsets.curve_in_y;
        param.curve_out_x = bone.bbone.curve_out_x + offsets.curve_out_x;
        param.curve_out_y = bone.bbone.curve_out_y + offsets.curve_out_y;

        param
    }

    /// Recomputes the B-Bone cache of channel `index`, or drops it for plain bones.
    pub fn update_bbone_cache(&mut self, armature: &Armature, index: usize) {
        let Some(bone) = armature.bone(index) else {
            return;
        };
        if !bone.is_bbone() {
            if let Some(channel) = self.channels_mut_internal().get_mut(index) {
                channel.free_bbone_cache();
            }
            return;
        }

        let pose_segments = compute_bbone_segments(&self.bbone_spline_params(armature, index, false));
        let rest_segments = compute_bbone_segments(&self.bbone_spline_params(armature, index, true));

        let Some(channel) = self.channels_mut_internal().get_mut(index) else {
            return;
        };

        let arm_mat = bone.arm_mat();
        let arm_inv = invert_or_identity(&arm_mat);
        let segments = pose_segments.len();

        let mut mats = Vec::with_capacity(segments + 1);
        let mut dual_quats = Vec::with_capacity(segments);
        mats.push(arm_inv);
        for (pose_seg, rest_seg) in pose_segments.iter().zip(&rest_segments) {
            let mat = channel.chan_mat * arm_mat * *pose_seg * invert_or_identity(rest_seg) * arm_inv;
            dual_quats.push(DualQuat::from_deform_matrix(&arm_mat, &mat));
            mats.push(mat);
        }

        let deform = Arc::new(BBoneDeform { mats, dual_quats });
        match &mut channel.bbone_cache {
            Some(cache) if cache.segments() == segments => {
                cache.rest.clone_from(&rest_segments);
                cache.pose.clone_from(&pose_segments);
                cache.deform = deform;
            }
            _ => {
                channel.bbone_cache = Some(BBoneCache {
                    rest: rest_segments,
                    pose: pose_segments,
                    deform,
                });
            }
        }
    }
}

/// Handle vectors and end rolls. `ease` scales the handles to their eased length,
/// `offsets` adds the user roll and curve offsets.
pub fn compute_bbone_handles(param: &BBoneSplineParameters, ease: bool, offsets: bool) -> BBoneHandles {
    let mut length = param.length;
    if param.do_scale {
        length *= param.scale.y;
    }

    let mut roll1 = 0.0;
    let mut roll2 = 0.0;

    let mut h1 = if param.use_prev {
        let mut h1 = param.prev_h;
        if param.prev_bbone {
            // Average direction with the previous B-Bone.
            h1.y -= length;
        }
        let h1 = -h1.normalize_or_zero();
        if !param.prev_bbone {
            roll1 = mat3_vec_to_roll(&Mat3::from_mat4(param.prev_mat), h1);
        }
        h1
    } else {
        Vec3::Y
    };

    let mut h2 = if param.use_next {
        let mut h2 = param.next_h;
        if !param.next_bbone {
            h2.y -= length;
        }
        let h2 = h2.normalize_or_zero();
        roll2 = mat3_vec_to_roll(&Mat3::from_mat4(param.next_mat), h2);
        h2
    } else {
        Vec3::Y
    };

    if ease {
        let circle_factor = length * (cubic_tangent_factor_circle(h1, h2) / 0.75);
        h1 *= param.ease1 * circle_factor;
        h2 *= -param.ease2 * circle_factor;
    }

    if offsets {
        roll1 += param.roll1;
        roll2 += param.roll2;

        let (x_correction, z_correction) = if param.do_scale {
            (param.scale.x, param.scale.z)
        } else {
            (1.0, 1.0)
        };

        h1.x += param.curve_in_x * x_correction;
        h1.z += param.curve_in_y * z_correction;
        h2.x += param.curve_out_x * x_correction;
        h2.z += param.curve_out_y * z_correction;
    }

    BBoneHandles {
        h1,
        roll1,
        h2,
        roll2,
    }
}

/// Segment matrices in bone space, `param.segments` of them (at most
/// [`MAX_BBONE_SUBDIVISIONS`]).
pub fn compute_bbone_segments(param: &BBoneSplineParameters) -> Vec<Mat4> {
    let mut length = param.length;
    let mut scale_mats = None;
    if param.do_scale {
        let scale_mat = Mat4::from_scale(param.scale);
        scale_mats = Some((scale_mat, invert_or_identity(&scale_mat)));
        length *= param.scale.y;
    }

    let BBoneHandles {
        h1,
        roll1,
        h2,
        roll2,
    } = compute_bbone_handles(param, true, true);

    let segments = param.segments.clamp(1, MAX_BBONE_SUBDIVISIONS);

    let mut points = [[0.0f32; 4]; MAX_BBONE_SUBDIVISIONS + 1];
    let n = MAX_BBONE_SUBDIVISIONS;
    forward_diff_bezier([0.0, h1.x, h2.x, 0.0], n, &mut points, 0);
    forward_diff_bezier([0.0, h1.y, length + h2.y, length], n, &mut points, 1);
    forward_diff_bezier([0.0, h1.z, h2.z, 0.0], n, &mut points, 2);
    forward_diff_bezier(
        [
            roll1,
            roll1 + ROLL_BEZIER_BLEND * (roll2 - roll1),
            roll2 - ROLL_BEZIER_BLEND * (roll2 - roll1),
            roll2,
        ],
        n,
        &mut points,
        3,
    );

    equalize_bezier(&mut points, segments);

    let mut result = Vec::with_capacity(segments);
    for a in 0..segments {
        let p = Vec3::from_slice(&points[a][..3]);
        let next = Vec3::from_slice(&points[a + 1][..3]);
        let mut mat = mat4_from_mat3_translation(vec_roll_to_mat3(next - p, points[a][3]), p);

        if let Some((scale_mat, iscale_mat)) = scale_mats {
            // Correct for the matrix being used in scaled space.
            mat = iscale_mat * mat * scale_mat;
        }

        // Not inverse corrected, that breaks segment chains under scale.
        let scale_in = 1.0 + (param.scale_in - 1.0) * ((segments - a) as f32 / segments as f32);
        let scale_out = 1.0 + (param.scale_out - 1.0) * ((a + 1) as f32 / segments as f32);
        let factor = scale_in * scale_out;
        mat *= Mat4::from_scale(Vec3::new(factor, 1.0, factor));

        result.push(mat);
    }
    result
}

/// Resamples the forward-differenced points so the first `desired + 1` are equally spaced
/// by arc length. The last of them is the curve end.
fn equalize_bezier(points: &mut [[f32; 4]; MAX_BBONE_SUBDIVISIONS + 1], desired: usize) {
    let n = MAX_BBONE_SUBDIVISIONS;
    let temp = *points;
    let xyz = |p: &[f32; 4]| Vec3::new(p[0], p[1], p[2]);

    let mut pdist = [0.0f32; MAX_BBONE_SUBDIVISIONS + 1];
    for a in 0..n {
        pdist[a + 1] = pdist[a] + xyz(&temp[a]).distance(xyz(&temp[a + 1]));
    }

    let ddist = pdist[n] / desired as f32;
    let mut nr = 1;
    for a in 1..desired {
        let dist = a as f32 * ddist;
        while nr < n && dist >= pdist[nr] {
            nr += 1;
        }

        let span = pdist[nr] - pdist[nr - 1];
        let fac1 = if span > 0.0 {
            (pdist[nr] - dist) / span
        } else {
            0.0
        };
        let fac2 = 1.0 - fac1;
        for c in 0..4 {
            points[a][c] = fac1 * temp[nr - 1][c] + fac2 * temp[nr][c];
        }
    }
    points[desired] = temp[n];
}
