use crate::geometry::{invert_mat3_or_identity, mat4_from_mat3_translation};
use crate::roll::{mat3_vec_to_roll, vec_roll_to_mat3};
use crate::{Armature, BBoneShape, Bone, BoneFlags, Envelope};
use glam::{Mat3, Mat4, Vec3};

/// Bone with armature-space head/tail, the form bones are authored in.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EditBone {
    pub name: String,
    pub parent: Option<String>,
    pub head: Vec3,
    pub tail: Vec3,
    pub roll: f32,
    pub flags: BoneFlags,
    pub layer: u32,
    pub segments: u32,
    pub bbone: BBoneShape,
    pub envelope: Envelope,
}

impl EditBone {
    pub fn new(name: impl Into<String>, head: Vec3, tail: Vec3) -> Self {
        Self {
            name: name.into(),
            parent: None,
            head,
            tail,
            roll: 0.0,
            flags: BoneFlags::empty(),
            layer: 1,
            segments: 1,
            bbone: BBoneShape::REST,
            envelope: Envelope::default(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_roll(mut self, roll: f32) -> Self {
        self.roll = roll;
        self
    }

    pub fn with_flags(mut self, flags: BoneFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_segments(mut self, segments: u32) -> Self {
        self.segments = segments;
        self
    }

    fn rest_basis(&self) -> Mat3 {
        vec_roll_to_mat3(self.tail - self.head, self.roll)
    }
}

impl Armature {
    /// `translate(head + parent length along Y) * bone_mat`: this bone's rest matrix
    /// relative to its parent's. Roots get their rest matrix in object space.
    pub fn offset_matrix(&self, index: usize) -> Mat4 {
        let Some(bone) = self.bone(index) else {
            return Mat4::IDENTITY;
        };
        let parent_length = bone
            .parent()
            .and_then(|p| self.bone(p))
            .map(|p| p.length())
            .unwrap_or(0.0);
        mat4_from_mat3_translation(bone.bone_mat(), bone.head + Vec3::new(0.0, parent_length, 0.0))
    }

    /// Recomputes lengths, bone matrices and armature-space rest matrices, parents first.
    pub fn update_rest_pose(&mut self) {
        let mut zero_length = 0usize;
        for index in self.pre_order() {
            if !self.update_bone_rest(index) {
                zero_length += 1;
            }
        }

        if zero_length > 0 {
            log::warn!(
                "armature '{}' has {zero_length} zero-length bone(s)",
                self.name
            );
        }
        self.clear_rest_dirty();
        log::debug!("updated rest pose of armature '{}'", self.name);
    }

    /// Rest data of a single bone from its (already updated) parent. Returns `false` for a
    /// zero-length bone.
    fn update_bone_rest(&mut self, index: usize) -> bool {
        let parent_rest = self.bones()[index].parent().map(|p| {
            let parent = &self.bones()[p];
            (parent.arm_mat(), parent.length())
        });

        let bone = &mut self.bones_mut_internal()[index];
        let delta = bone.tail - bone.head;
        let length = delta.length();
        let bone_mat = vec_roll_to_mat3(delta, bone.roll);

        if bone.xwidth == 0.0 {
            bone.xwidth = 0.1;
            bone.zwidth = 0.1;
            bone.segments = 1;
        }
        if bone.segments == 0 {
            bone.segments = 1;
        }

        let arm_mat = match parent_rest {
            Some((parent_arm, parent_length)) => {
                parent_arm
                    * mat4_from_mat3_translation(
                        bone_mat,
                        bone.head + Vec3::new(0.0, parent_length, 0.0),
                    )
            }
            None => mat4_from_mat3_translation(bone_mat, bone.head),
        };
        bone.set_rest(length, bone_mat, arm_mat);
        length > f32::EPSILON
    }

    /// Builds an armature from armature-space bones. Parents must precede their children.
    /// The rest pose is up to date on return.
    pub fn from_edit_bones(
        name: impl Into<String>,
        edit_bones: &[EditBone],
    ) -> Result<Self, crate::Error> {
        let mut armature = Armature::new(name);
        // Edit bones with connected heads snapped onto their parent's tail.
        let mut placed: Vec<EditBone> = Vec::with_capacity(edit_bones.len());

        for edit in edit_bones {
            let parent = match &edit.parent {
                Some(parent_name) => Some(armature.find_bone(parent_name).ok_or_else(|| {
                    crate::Error::UnknownBoneParent {
                        bone: edit.name.clone(),
                        parent: parent_name.clone(),
                    }
                })?),
                None => None,
            };

            let mut edit = edit.clone();
            let mut bone = Bone::new(edit.name.clone(), edit.head, edit.tail);
            bone.flags = edit.flags;
            bone.layer = edit.layer;
            bone.segments = edit.segments.max(1);
            bone.bbone = edit.bbone;
            bone.envelope = edit.envelope;

            if let Some(parent) = parent {
                let parent_edit = &placed[parent];
                if edit.flags.contains(BoneFlags::CONNECTED) {
                    edit.head = parent_edit.tail;
                }
                let inv_parent = invert_mat3_or_identity(&parent_edit.rest_basis());
                bone.head = inv_parent * (edit.head - parent_edit.tail);
                bone.tail = inv_parent * (edit.tail - parent_edit.tail);
            }

            armature.add_bone(bone, parent)?;
            placed.push(edit);
        }

        // Rolls are only known once the parent frames exist: solve each bone with zero
        // roll, then pick the roll that lines its rest matrix up with the edit basis.
        for index in armature.pre_order() {
            armature.bones_mut_internal()[index].roll = 0.0;
            armature.update_bone_rest(index);

            let edit_basis = placed[index].rest_basis();
            let arm_basis = Mat3::from_mat4(armature.bones()[index].arm_mat());
            let diff = invert_mat3_or_identity(&edit_basis) * arm_basis;
            armature.bones_mut_internal()[index].roll = -diff.z_axis.x.atan2(diff.z_axis.z);
            armature.update_bone_rest(index);
        }
        armature.update_rest_pose();

        Ok(armature)
    }

    /// Armature-space view of every bone, in index order.
    pub fn edit_bones(&self) -> Vec<EditBone> {
        self.bones()
            .iter()
            .map(|bone| {
                let arm_basis = Mat3::from_mat4(bone.arm_mat());
                EditBone {
                    name: bone.name().to_string(),
                    parent: bone
                        .parent()
                        .and_then(|p| self.bone(p))
                        .map(|p| p.name().to_string()),
                    head: bone.arm_head(),
                    tail: bone.arm_tail(),
                    roll: mat3_vec_to_roll(&arm_basis, bone.arm_tail() - bone.arm_head()),
                    flags: bone.flags,
                    layer: bone.layer,
                    segments: bone.segments,
                    bbone: bone.bbone,
                    envelope: bone.envelope,
                }
            })
            .collect()
    }
}
