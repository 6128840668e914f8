//! Skinning of points (mesh vertices, lattice points, stroke points) by a solved pose.

use crate::geometry::invert_or_identity;
use crate::{Armature, ArmatureObject, BoneFlags, DeformCache, DeformFlags, DualQuat};
use glam::{Mat3, Mat4, Vec3};
use rayon::prelude::*;

/// Accumulated weights at or below this leave a point where it is.
pub const CONTRIBUTION_EPSILON: f32 = 0.0001;

/// Above this many points the deformation runs on the rayon pool.
pub const PARALLEL_VERTEX_THRESHOLD: usize = 1024;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TargetKind {
    #[default]
    Mesh,
    Lattice,
    Stroke,
}

/// How vertex-group weights accumulate over the groups of one point.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WeightLimit {
    #[default]
    Unlimited,
    /// Later groups only get what is left up to a total of 1.0, then the rest is skipped.
    ClampToOne,
}

impl TargetKind {
    pub fn default_weight_limit(self) -> WeightLimit {
        match self {
            TargetKind::Stroke => WeightLimit::ClampToOne,
            TargetKind::Mesh | TargetKind::Lattice => WeightLimit::Unlimited,
        }
    }
}

/// One entry of a point's sparse weight list.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VertexWeight {
    /// Index into [`DeformTarget::vertex_groups`].
    pub group: usize,
    pub weight: f32,
}

impl VertexWeight {
    pub fn new(group: usize, weight: f32) -> Self {
        Self { group, weight }
    }
}

/// The object being deformed.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeformTarget {
    pub name: String,
    pub kind: TargetKind,
    /// Object matrix of the target.
    pub matrix: Mat4,
    /// Vertex group names, matched against pose channel names.
    pub vertex_groups: Vec<String>,
    /// Per-point weights. Must have one entry per point when present.
    pub weights: Option<Vec<Vec<VertexWeight>>>,
}

impl DeformTarget {
    pub fn new(name: impl Into<String>, kind: TargetKind) -> Self {
        Self {
            name: name.into(),
            kind,
            matrix: Mat4::IDENTITY,
            vertex_groups: Vec::new(),
            weights: None,
        }
    }

    fn group_index(&self, name: &str) -> Option<usize> {
        self.vertex_groups.iter().position(|group| group == name)
    }
}

/// Caller-owned point data.
#[derive(Debug)]
pub struct DeformBuffers<'a> {
    /// Target-space positions, deformed in place.
    pub positions: &'a mut [Vec3],
    /// Positions before the previous modifier. When present the armature group weight
    /// blends between `positions` and the deformed `previous` instead of scaling the
    /// deformation.
    pub previous: Option<&'a [Vec3]>,
    /// Per-point 3x3 deformation matrices, composed in place.
    pub deform_mats: Option<&'a mut [Mat3]>,
}

impl<'a> DeformBuffers<'a> {
    pub fn new(positions: &'a mut [Vec3]) -> Self {
        Self {
            positions,
            previous: None,
            deform_mats: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeformOptions {
    pub flags: DeformFlags,
    /// Vertex group scaling the whole deformation per point.
    pub armature_group: Option<String>,
    /// Overrides the target kind's default.
    pub weight_limit: Option<WeightLimit>,
    pub parallel_threshold: usize,
}

impl Default for DeformOptions {
    fn default() -> Self {
        Self {
            flags: DeformFlags::default(),
            armature_group: None,
            weight_limit: None,
            parallel_threshold: PARALLEL_VERTEX_THRESHOLD,
        }
    }
}

impl DeformOptions {
    /// Options using the armature's default deform flags.
    pub fn from_armature(armature: &Armature) -> Self {
        Self {
            flags: armature.deform_flags,
            ..Self::default()
        }
    }
}

/// Deforms `buffers` by the published deform cache of `object`.
///
/// Nothing is written when the pose needs a rebuild, the cache is missing or stale, or a
/// buffer length does not match the point count.
pub fn deform_vertices(
    object: &ArmatureObject,
    target: &DeformTarget,
    buffers: DeformBuffers<'_>,
    options: &DeformOptions,
) -> Result<(), crate::Error> {
    let armature = object.armature();

    if object.pose.is_stale(armature) {
        log::error!(
            "trying to evaluate influence of armature '{}' which needs pose recalc",
            object.name
        );
        return Err(crate::Error::PoseNeedsRecalc {
            armature: object.name.clone(),
        });
    }

    let Some(cache) = object.deform_cache() else {
        log::error!(
            "armature '{}' does not have a deform cache, '{}' left undeformed",
            object.name,
            target.name
        );
        return Err(crate::Error::MissingDeformCache {
            armature: object.name.clone(),
        });
    };
    if cache.len() != object.pose.len() || cache.topology_version != armature.topology_version() {
        log::error!(
            "deform cache of armature '{}' is stale ({} cached, {} channels)",
            object.name,
            cache.len(),
            object.pose.len()
        );
        return Err(crate::Error::StaleDeformCache {
            armature: object.name.clone(),
            cached: cache.len(),
            channels: object.pose.len(),
        });
    }

    let count = buffers.positions.len();
    let lengths = [
        ("previous", buffers.previous.map(<[Vec3]>::len)),
        ("deform_mats", buffers.deform_mats.as_deref().map(<[Mat3]>::len)),
        ("weights", target.weights.as_deref().map(<[Vec<VertexWeight>]>::len)),
    ];
    for (buffer, len) in lengths {
        if let Some(actual) = len.filter(|&len| len != count) {
            log::error!(
                "deform target '{}' has {actual} entries in '{buffer}', expected {count}",
                target.name
            );
            return Err(crate::Error::BufferLength {
                target: target.name.clone(),
                buffer,
                expected: count,
                actual,
            });
        }
    }

    let deformer = Deformer::new(object, &cache, target, options, buffers.previous.is_some());
    let weights = deformer.weights;
    let previous = buffers.previous;
    let parallel = count > options.parallel_threshold;

    let work = |index: usize, co: &mut Vec3, deform_mat: Option<&mut Mat3>| {
        let point_weights = weights.map(|weights| weights[index].as_slice());
        let prev = previous.map(|previous| previous[index]);
        *co = deformer.deform_point(*co, prev, point_weights, deform_mat);
    };

    match buffers.deform_mats {
        Some(mats) if parallel => buffers
            .positions
            .par_iter_mut()
            .zip(mats.par_iter_mut())
            .enumerate()
            .for_each(|(index, (co, mat))| work(index, co, Some(mat))),
        Some(mats) => buffers
            .positions
            .iter_mut()
            .zip(mats.iter_mut())
            .enumerate()
            .for_each(|(index, (co, mat))| work(index, co, Some(mat))),
        None if parallel => buffers
            .positions
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, co)| work(index, co, None)),
        None => buffers
            .positions
            .iter_mut()
            .enumerate()
            .for_each(|(index, co)| work(index, co, None)),
    }

    log::trace!(
        "deformed {count} point(s) of '{}' by armature '{}'",
        target.name,
        object.name
    );
    Ok(())
}

/// Per-call state shared by every point.
struct Deformer<'a> {
    armature: &'a Armature,
    cache: &'a DeformCache,
    /// Vertex group index to deforming channel.
    group_channels: Vec<Option<usize>>,
    /// Per-point weights, when groups are read at all.
    weights: Option<&'a [Vec<VertexWeight>]>,
    armature_group: Option<usize>,
    premat: Mat4,
    postmat: Mat4,
    use_vertex_groups: bool,
    use_envelope: bool,
    use_quaternion: bool,
    invert_armature_group: bool,
    has_previous: bool,
    weight_limit: WeightLimit,
}

struct Accumulator {
    vec: Vec3,
    mat: Mat3,
    dual_quat: DualQuat,
    contrib: f32,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self {
            vec: Vec3::ZERO,
            mat: Mat3::ZERO,
            dual_quat: DualQuat::ZERO,
            contrib: 0.0,
        }
    }
}

impl<'a> Deformer<'a> {
    fn new(
        object: &'a ArmatureObject,
        cache: &'a DeformCache,
        target: &'a DeformTarget,
        options: &DeformOptions,
        has_previous: bool,
    ) -> Self {
        let armature = object.armature().as_ref();
        let use_vertex_groups = options.flags.contains(DeformFlags::VERTEX_GROUPS) && target.weights.is_some();
        let armature_group = options
            .armature_group
            .as_deref()
            .and_then(|name| target.group_index(name));

        let group_channels = if use_vertex_groups {
            target
                .vertex_groups
                .iter()
                .map(|name| {
                    object
                        .pose
                        .find_channel(name)
                        .filter(|&index| cache.channels.get(index).is_some_and(|c| c.deforms))
                })
                .collect()
        } else {
            Vec::new()
        };

        let weights = if use_vertex_groups || armature_group.is_some() {
            target.weights.as_deref()
        } else {
            None
        };

        let postmat = invert_or_identity(&target.matrix) * object.matrix;
        Self {
            armature,
            cache,
            group_channels,
            weights,
            armature_group,
            premat: invert_or_identity(&postmat),
            postmat,
            use_vertex_groups,
            use_envelope: options.flags.contains(DeformFlags::ENVELOPE),
            use_quaternion: options.flags.contains(DeformFlags::QUATERNION),
            invert_armature_group: options.flags.contains(DeformFlags::INVERT_VERTEX_GROUP),
            has_previous,
            weight_limit: options
                .weight_limit
                .unwrap_or_else(|| target.kind.default_weight_limit()),
        }
    }

    fn deform_point(
        &self,
        current: Vec3,
        previous: Option<Vec3>,
        weights: Option<&[VertexWeight]>,
        deform_mat: Option<&mut Mat3>,
    ) -> Vec3 {
        let mut armature_weight = 1.0;
        let mut previous_weight = 1.0;

        if let (Some(group), Some(weights)) = (self.armature_group, weights) {
            armature_weight = weights
                .iter()
                .find(|w| w.group == group)
                .map_or(0.0, |w| w.weight);
            if self.invert_armature_group {
                armature_weight = 1.0 - armature_weight;
            }
            // With previous positions the group weight blends instead.
            if self.has_previous {
                previous_weight = armature_weight;
                armature_weight = 1.0;
            }
        }

        if armature_weight == 0.0 {
            return current;
        }

        let mut co = self.premat.transform_point3(previous.unwrap_or(current));
        let mut acc = Accumulator::default();

        match weights.filter(|w| self.use_vertex_groups && !w.is_empty()) {
            Some(weights) => {
                let mut deformed = false;
                let mut accumulated = 0.0;
                for vertex_weight in weights {
                    let Some(index) = self.group_channels.get(vertex_weight.group).copied().flatten() else {
                        continue;
                    };
                    let Some(bone) = self.armature.bone(index) else {
                        continue;
                    };
                    deformed = true;

                    let mut weight = vertex_weight.weight;
                    if bone.flags.contains(BoneFlags::MULTIPLY_VGROUP_ENVELOPE) {
                        weight *= distfactor_to_bone(
                            co,
                            bone.arm_head(),
                            bone.arm_tail(),
                            bone.envelope.rad_head,
                            bone.envelope.rad_tail,
                            bone.envelope.dist,
                        );
                    }

                    if self.weight_limit == WeightLimit::ClampToOne {
                        if accumulated + weight >= 1.0 {
                            weight = 1.0 - accumulated;
                        }
                        accumulated += weight;
                    }

                    self.bone_deform(index, weight, co, &mut acc);

                    if self.weight_limit == WeightLimit::ClampToOne && accumulated >= 1.0 {
                        break;
                    }
                }

                // Groups that belong to no deforming bone.
                if !deformed && self.use_envelope {
                    self.envelope_deform_all(co, &mut acc);
                }
            }
            None if self.use_envelope => self.envelope_deform_all(co, &mut acc),
            None => {}
        }

        if acc.contrib > CONTRIBUTION_EPSILON {
            let sum_mat = if self.use_quaternion {
                acc.dual_quat.normalize_by(acc.contrib);
                let (deformed, mat) = acc.dual_quat.transform_point(co);
                if armature_weight != 1.0 {
                    co += (deformed - co) * armature_weight;
                } else {
                    co = deformed;
                }
                // Already scale corrected.
                mat
            } else {
                let factor = armature_weight / acc.contrib;
                co += acc.vec * factor;
                acc.mat * factor
            };

            if let Some(deform_mat) = deform_mat {
                let pre = Mat3::from_mat4(self.premat);
                let post = Mat3::from_mat4(self.postmat);
                *deform_mat = post * sum_mat * pre * *deform_mat;
            }
        }

        co = self.postmat.transform_point3(co);

        if self.has_previous {
            previous_weight * current + (1.0 - previous_weight) * co
        } else {
            co
        }
    }

    /// Adds channel `index` with `weight` to the accumulator. Zero weights are skipped.
    fn bone_deform(&self, index: usize, weight: f32, co: Vec3, acc: &mut Accumulator) {
        if weight == 0.0 {
            return;
        }
        let (Some(channel), Some(bone)) = (self.cache.channels.get(index), self.armature.bone(index)) else {
            return;
        };

        let segment = channel
            .bbone
            .as_deref()
            .map(|bbone| (bbone, bbone.segment_index(co, bone.length())));

        if self.use_quaternion {
            let dual_quat = match segment {
                Some((bbone, a)) => &bbone.dual_quats[a],
                None => &channel.dual_quat,
            };
            acc.dual_quat.add_weighted(dual_quat, weight);
        } else {
            let mat = match segment {
                Some((bbone, a)) => bbone.mats[a + 1],
                None => channel.chan_mat,
            };
            acc.vec += (mat.transform_point3(co) - co) * weight;
            acc.mat = acc.mat + Mat3::from_mat4(mat) * weight;
        }
        acc.contrib += weight;
    }

    /// Envelope influence of every deforming bone.
    fn envelope_deform_all(&self, co: Vec3, acc: &mut Accumulator) {
        for (index, (channel, bone)) in self.cache.channels.iter().zip(self.armature.bones()).enumerate() {
            if !channel.deforms {
                continue;
            }
            let envelope = &bone.envelope;
            let fac = distfactor_to_bone(
                co,
                bone.arm_head(),
                bone.arm_tail(),
                envelope.rad_head,
                envelope.rad_tail,
                envelope.dist,
            );
            if fac > 0.0 {
                let fac = fac * envelope.weight;
                if fac > 0.0 {
                    self.bone_deform(index, fac, co, acc);
                } else {
                    // A negative envelope weight still counts against the total.
                    acc.contrib += fac;
                }
            }
        }
    }
}

/// Envelope falloff of `point` around the capsule from `head` to `tail`: 1.0 inside the
/// radius (interpolated along the bone, spherical past either end), falling off
/// quadratically to 0.0 over `dist` outside it.
pub fn distfactor_to_bone(point: Vec3, head: Vec3, tail: Vec3, rad_head: f32, rad_tail: f32, dist: f32) -> f32 {
    let delta = tail - head;
    let length = delta.length();
    let direction = if length > 0.0 { delta / length } else { Vec3::ZERO };
    let offset = point - head;

    let a = direction.dot(offset);
    let (dist_sq, rad) = if a < 0.0 {
        (head.distance_squared(point), rad_head)
    } else if a > length {
        (tail.distance_squared(point), rad_tail)
    } else {
        let rad = if length != 0.0 {
            let t = a / length;
            t * rad_tail + (1.0 - t) * rad_head
        } else {
            rad_head
        };
        (offset.length_squared() - a * a, rad)
    };

    if dist_sq < rad * rad {
        return 1.0;
    }
    let outer = (rad + dist) * (rad + dist);
    if dist == 0.0 || dist_sq >= outer {
        return 0.0;
    }
    let a = dist_sq.sqrt() - rad;
    1.0 - (a * a) / (dist * dist)
}
