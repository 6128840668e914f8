use crate::geometry::{invert_or_identity, mat4_to_size, mat4_translation, normalize_mat4};
use crate::{Armature, BoneFlags, Pose};
use glam::{Mat4, Vec3};

/// Parent contribution to a bone's pose, split in two because location and orientation
/// can inherit differently (hinge, no-scale, no-local-location).
///
/// `pose = rotscale * local` for orientation and scale, while the head is placed with
/// `loc * local_translation`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BoneParentTransform {
    pub rotscale: Mat4,
    pub loc: Mat4,
}

impl Default for BoneParentTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl BoneParentTransform {
    pub const IDENTITY: Self = Self {
        rotscale: Mat4::IDENTITY,
        loc: Mat4::IDENTITY,
    };

    /// `offs_bone` is the offset matrix from the parent's rest matrix (or the rest matrix
    /// itself for a root); `parent` holds the parent's `(arm_mat, pose_mat)`.
    pub fn from_matrices(flags: BoneFlags, offs_bone: &Mat4, parent: Option<(&Mat4, &Mat4)>) -> Self {
        let Some((parent_arm, parent_pose)) = parent else {
            let loc = if flags.contains(BoneFlags::NO_LOCAL_LOCATION) {
                Mat4::from_translation(mat4_translation(offs_bone))
            } else {
                *offs_bone
            };
            return Self {
                rotscale: *offs_bone,
                loc,
            };
        };

        let hinge = flags.contains(BoneFlags::HINGE);
        let no_scale = flags.contains(BoneFlags::NO_SCALE);

        let rotscale = if hinge && no_scale {
            *parent_arm * *offs_bone
        } else if hinge {
            Mat4::from_scale(mat4_to_size(parent_pose)) * *parent_arm * *offs_bone
        } else if no_scale {
            normalize_mat4(parent_pose) * *offs_bone
        } else {
            *parent_pose * *offs_bone
        };

        let loc = if flags.contains(BoneFlags::NO_LOCAL_LOCATION) {
            // Object-space orientation of the parent, head placed by the full parent pose.
            let head = parent_pose.transform_point3(mat4_translation(offs_bone));
            let mut orientation = *parent_pose;
            orientation.w_axis = Vec3::ZERO.extend(1.0);
            Mat4::from_translation(head) * orientation
        } else if hinge || no_scale {
            *parent_pose * *offs_bone
        } else {
            rotscale
        };

        Self { rotscale, loc }
    }

    /// Parent transform of channel `index` from the current pose of its parent.
    pub fn for_channel(armature: &Armature, pose: &Pose, index: usize) -> Self {
        let Some(bone) = armature.bone(index) else {
            return Self::IDENTITY;
        };
        let parent = pose
            .channel(index)
            .and_then(|channel| channel.parent())
            .and_then(|p| Some((armature.bone(p)?, pose.channel(p)?)));

        match parent {
            Some((parent_bone, parent_channel)) => {
                let offs_bone = armature.offset_matrix(index);
                let parent_arm = parent_bone.arm_mat();
                let parent_pose = parent_channel.pose_mat();
                Self::from_matrices(bone.flags, &offs_bone, Some((&parent_arm, &parent_pose)))
            }
            None => Self::from_matrices(bone.flags, &bone.arm_mat(), None),
        }
    }

    pub fn inverted(&self) -> Self {
        Self {
            rotscale: invert_or_identity(&self.rotscale),
            loc: invert_or_identity(&self.loc),
        }
    }

    /// `self` applied after `other`.
    pub fn combine(&self, other: &Self) -> Self {
        Self {
            rotscale: self.rotscale * other.rotscale,
            loc: self.loc * other.loc,
        }
    }

    pub fn apply(&self, mat: &Mat4) -> Mat4 {
        let mut out = self.rotscale * *mat;
        out.w_axis = self.loc.transform_point3(mat4_translation(mat)).extend(1.0);
        out
    }

    pub fn apply_point(&self, point: Vec3) -> Vec3 {
        self.loc.transform_point3(point)
    }
}

/// Rest-relative transform of a posed bone, `inverse(arm_mat) * pose_mat`.
pub fn mat_pose_to_delta(pose_mat: &Mat4, arm_mat: &Mat4) -> Mat4 {
    invert_or_identity(arm_mat) * *pose_mat
}

impl Pose {
    /// Pose-space matrix to the local space of channel `index`, ignoring the channel's
    /// own constraints.
    pub fn mat_pose_to_bone(&self, armature: &Armature, index: usize, mat: &Mat4) -> Mat4 {
        BoneParentTransform::for_channel(armature, self, index)
            .inverted()
            .apply(mat)
    }

    pub fn mat_bone_to_pose(&self, armature: &Armature, index: usize, mat: &Mat4) -> Mat4 {
        BoneParentTransform::for_channel(armature, self, index).apply(mat)
    }

    pub fn loc_pose_to_bone(&self, armature: &Armature, index: usize, loc: Vec3) -> Vec3 {
        mat4_translation(&self.mat_pose_to_bone(armature, index, &Mat4::from_translation(loc)))
    }
}
