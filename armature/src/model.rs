use glam::{Mat3, Mat4, Vec3};
use std::collections::{BTreeMap, HashMap};

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BoneFlags: u32 {
        /// Head is attached to the parent's tail; animated location is ignored.
        const CONNECTED = 1 << 0;
        /// Ignore the parent's pose rotation.
        const HINGE = 1 << 1;
        /// Ignore the parent's pose scale.
        const NO_SCALE = 1 << 2;
        /// Place the head using the parent's object-space orientation.
        const NO_LOCAL_LOCATION = 1 << 3;
        const NO_DEFORM = 1 << 4;
        const NO_CYCLIC_OFFSET = 1 << 5;
        /// Vertex group weights are multiplied by the envelope falloff.
        const MULTIPLY_VGROUP_ENVELOPE = 1 << 6;
        /// Add the previous handle bone's end roll to this bone's start roll.
        const ADD_PARENT_END_ROLL = 1 << 7;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ArmatureFlags: u32 {
        /// Evaluate every bone at its rest matrix.
        const REST_POSITION = 1 << 0;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct DeformFlags: u32 {
        const VERTEX_GROUPS = 1 << 0;
        const ENVELOPE = 1 << 1;
        /// Dual quaternion blending instead of linear matrix blending.
        const QUATERNION = 1 << 2;
        /// Use `1 - w` for the armature-wide vertex group weight.
        const INVERT_VERTEX_GROUP = 1 << 3;
    }
}

impl Default for DeformFlags {
    fn default() -> Self {
        Self::VERTEX_GROUPS | Self::ENVELOPE
    }
}

/// How a B-Bone picks the neighbor used as the start/end handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BBoneHandleType {
    /// Connected parent for the start handle, connected child for the end handle.
    #[default]
    Auto,
    /// Explicit bone, its head/tail position.
    Absolute,
    /// Explicit bone, its movement away from its rest position.
    Relative,
    /// Explicit bone, its direction only.
    Tangent,
}

/// B-Bone shape parameters. Bones store the rest shape, pose channels store offsets
/// on top of it (added, except scale which multiplies).
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BBoneShape {
    pub ease_in: f32,
    pub ease_out: f32,
    pub roll_in: f32,
    pub roll_out: f32,
    pub curve_in_x: f32,
    pub curve_in_y: f32,
    pub curve_out_x: f32,
    pub curve_out_y: f32,
    pub scale_in: f32,
    pub scale_out: f32,
}

impl BBoneShape {
    pub const REST: Self = Self {
        ease_in: 1.0,
        ease_out: 1.0,
        roll_in: 0.0,
        roll_out: 0.0,
        curve_in_x: 0.0,
        curve_in_y: 0.0,
        curve_out_x: 0.0,
        curve_out_y: 0.0,
        scale_in: 1.0,
        scale_out: 1.0,
    };

    /// Neutral pose offsets.
    pub const OFFSET: Self = Self {
        ease_in: 0.0,
        ease_out: 0.0,
        ..Self::REST
    };
}

impl Default for BBoneShape {
    fn default() -> Self {
        Self::REST
    }
}

/// Capsule used for envelope deformation.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Envelope {
    pub rad_head: f32,
    pub rad_tail: f32,
    /// Falloff distance outside the radii.
    pub dist: f32,
    pub weight: f32,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            rad_head: 0.1,
            rad_tail: 0.05,
            dist: 0.25,
            weight: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PropertyValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
}

impl PropertyValue {
    fn same_kind(&self, other: &PropertyValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// User property blob attached to bones and pose channels. Opaque to evaluation.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Properties(pub BTreeMap<String, PropertyValue>);

impl Properties {
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: PropertyValue) {
        self.0.insert(key.into(), value);
    }

    /// Copies values from `other` for keys present in both with the same value kind.
    pub fn sync_values_from(&mut self, other: &Properties) {
        for (key, value) in &mut self.0 {
            if let Some(src) = other.0.get(key) {
                if value.same_kind(src) {
                    *value = src.clone();
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Bone {
    name: String,
    /// Parent space: relative to the parent's tail in the parent's bone frame, object
    /// space for roots.
    pub head: Vec3,
    pub tail: Vec3,
    pub roll: f32,
    pub flags: BoneFlags,
    pub layer: u32,

    /// B-Bone segment count, 1 for a plain bone.
    pub segments: u32,
    pub bbone: BBoneShape,
    pub bbone_prev_type: BBoneHandleType,
    pub bbone_next_type: BBoneHandleType,
    pub bbone_prev: Option<usize>,
    pub bbone_next: Option<usize>,

    pub envelope: Envelope,
    pub xwidth: f32,
    pub zwidth: f32,
    pub properties: Option<Properties>,

    parent: Option<usize>,
    children: Vec<usize>,

    length: f32,
    bone_mat: Mat3,
    arm_mat: Mat4,
    arm_head: Vec3,
    arm_tail: Vec3,
}

impl Bone {
    pub fn new(name: impl Into<String>, head: Vec3, tail: Vec3) -> Self {
        Self {
            name: name.into(),
            head,
            tail,
            roll: 0.0,
            flags: BoneFlags::empty(),
            layer: 1,
            segments: 1,
            bbone: BBoneShape::REST,
            bbone_prev_type: BBoneHandleType::Auto,
            bbone_next_type: BBoneHandleType::Auto,
            bbone_prev: None,
            bbone_next: None,
            envelope: Envelope::default(),
            xwidth: 0.1,
            zwidth: 0.1,
            properties: None,
            parent: None,
            children: Vec::new(),
            length: 0.0,
            bone_mat: Mat3::IDENTITY,
            arm_mat: Mat4::IDENTITY,
            arm_head: Vec3::ZERO,
            arm_tail: Vec3::ZERO,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }

    pub fn length(&self) -> f32 {
        self.length
    }

    /// Rest orientation in parent space.
    pub fn bone_mat(&self) -> Mat3 {
        self.bone_mat
    }

    /// Rest matrix in armature (object) space.
    pub fn arm_mat(&self) -> Mat4 {
        self.arm_mat
    }

    pub fn arm_head(&self) -> Vec3 {
        self.arm_head
    }

    pub fn arm_tail(&self) -> Vec3 {
        self.arm_tail
    }

    pub fn is_bbone(&self) -> bool {
        self.segments > 1
    }

    pub(crate) fn set_rest(&mut self, length: f32, bone_mat: Mat3, arm_mat: Mat4) {
        self.length = length;
        self.bone_mat = bone_mat;
        self.arm_mat = arm_mat;
        self.arm_head = arm_mat.w_axis.truncate();
        self.arm_tail = self.arm_head + arm_mat.y_axis.truncate() * length;
    }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Armature {
    pub name: String,
    bones: Vec<Bone>,
    roots: Vec<usize>,
    bone_index: HashMap<String, usize>,

    pub flags: ArmatureFlags,
    /// Visible layers.
    pub layer: u32,
    /// Layers whose channels are overwritten by a proxy source.
    pub layer_protected: u32,
    pub deform_flags: DeformFlags,

    topology_version: u64,
    rest_dirty: bool,
}

impl Armature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bones: Vec::new(),
            roots: Vec::new(),
            bone_index: HashMap::new(),
            flags: ArmatureFlags::empty(),
            layer: 1,
            layer_protected: 0,
            deform_flags: DeformFlags::default(),
            topology_version: 0,
            rest_dirty: false,
        }
    }

    pub fn bones(&self) -> &[Bone] {
        &self.bones
    }

    pub fn bone(&self, index: usize) -> Option<&Bone> {
        self.bones.get(index)
    }

    /// Mutable access to rest data. Marks the rest pose dirty.
    pub fn bone_mut(&mut self, index: usize) -> Option<&mut Bone> {
        let bone = self.bones.get_mut(index)?;
        self.rest_dirty = true;
        Some(bone)
    }

    pub fn find_bone(&self, name: &str) -> Option<usize> {
        self.bone_index.get(name).copied()
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.bones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    /// Bumped whenever bones are added or reparented.
    pub fn topology_version(&self) -> u64 {
        self.topology_version
    }

    /// True when bone geometry changed since the last rest-pose update.
    pub fn rest_dirty(&self) -> bool {
        self.rest_dirty
    }

    pub(crate) fn bones_mut_internal(&mut self) -> &mut [Bone] {
        &mut self.bones
    }

    pub(crate) fn clear_rest_dirty(&mut self) {
        self.rest_dirty = false;
    }

    pub fn add_bone(&mut self, bone: Bone, parent: Option<usize>) -> Result<usize, crate::Error> {
        if self.bone_index.contains_key(&bone.name) {
            return Err(crate::Error::DuplicateBoneName { name: bone.name });
        }
        if !(bone.head.is_finite() && bone.tail.is_finite() && bone.roll.is_finite()) {
            return Err(crate::Error::InvalidValue {
                message: format!("bone '{}' has a non-finite head, tail or roll", bone.name),
            });
        }
        if let Some(parent) = parent {
            if parent >= self.bones.len() {
                return Err(crate::Error::InvalidBoneIndex { index: parent });
            }
        }

        let index = self.bones.len();
        let mut bone = bone;
        bone.parent = parent;
        bone.children.clear();
        if parent.is_none() {
            bone.flags.remove(BoneFlags::CONNECTED);
        }

        self.bone_index.insert(bone.name.clone(), index);
        self.bones.push(bone);
        match parent {
            Some(parent) => self.bones[parent].children.push(index),
            None => self.roots.push(index),
        }

        self.topology_version += 1;
        self.rest_dirty = true;
        Ok(index)
    }

    /// Like [`Armature::add_bone`], resolving the parent by name.
    pub fn add_bone_with_parent_name(
        &mut self,
        bone: Bone,
        parent: Option<&str>,
    ) -> Result<usize, crate::Error> {
        let parent_index = match parent {
            Some(parent) => Some(self.find_bone(parent).ok_or_else(|| {
                crate::Error::UnknownBoneParent {
                    bone: bone.name.clone(),
                    parent: parent.to_string(),
                }
            })?),
            None => None,
        };
        self.add_bone(bone, parent_index)
    }

    pub fn rename_bone(&mut self, index: usize, name: impl Into<String>) -> Result<(), crate::Error> {
        let name = name.into();
        if index >= self.bones.len() {
            return Err(crate::Error::InvalidBoneIndex { index });
        }
        if let Some(existing) = self.find_bone(&name) {
            if existing == index {
                return Ok(());
            }
            return Err(crate::Error::DuplicateBoneName { name });
        }

        let old = std::mem::replace(&mut self.bones[index].name, name.clone());
        self.bone_index.remove(&old);
        self.bone_index.insert(name, index);
        // Pose channels are matched by name.
        self.topology_version += 1;
        Ok(())
    }

    /// Moves `index` under `parent` (or to the roots). Head/tail stay in the old parent's
    /// space; callers that want to keep the armature-space placement should go through
    /// [`Armature::from_edit_bones`].
    pub fn set_parent(&mut self, index: usize, parent: Option<usize>) -> Result<(), crate::Error> {
        if index >= self.bones.len() {
            return Err(crate::Error::InvalidBoneIndex { index });
        }
        if let Some(parent) = parent {
            if parent >= self.bones.len() {
                return Err(crate::Error::InvalidBoneIndex { index: parent });
            }
            let mut cursor = Some(parent);
            while let Some(current) = cursor {
                if current == index {
                    return Err(crate::Error::ParentCycle {
                        bone: self.bones[index].name.clone(),
                        parent: self.bones[parent].name.clone(),
                    });
                }
                cursor = self.bones[current].parent;
            }
        }

        match self.bones[index].parent {
            Some(old) => self.bones[old].children.retain(|&c| c != index),
            None => self.roots.retain(|&r| r != index),
        }
        self.bones[index].parent = parent;
        match parent {
            Some(parent) => self.bones[parent].children.push(index),
            None => {
                self.bones[index].flags.remove(BoneFlags::CONNECTED);
                self.roots.push(index);
            }
        }

        self.topology_version += 1;
        self.rest_dirty = true;
        Ok(())
    }

    /// Like [`Armature::set_parent`], resolving both bones by name.
    pub fn set_parent_by_name(&mut self, bone: &str, parent: Option<&str>) -> Result<(), crate::Error> {
        let index = self
            .find_bone(bone)
            .ok_or_else(|| crate::Error::UnknownBone { name: bone.to_string() })?;
        let parent_index = match parent {
            Some(parent) => Some(self.find_bone(parent).ok_or_else(|| {
                crate::Error::UnknownBoneParent {
                    bone: bone.to_string(),
                    parent: parent.to_string(),
                }
            })?),
            None => None,
        };
        self.set_parent(index, parent_index)
    }

    /// Parent-before-child order: roots in insertion order, children depth first.
    pub fn pre_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.bones.len());
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(index) = stack.pop() {
            order.push(index);
            stack.extend(self.bones[index].children.iter().rev().copied());
        }
        order
    }

    /// Last connected child, used as the automatic end handle of a B-Bone.
    pub fn connected_child(&self, index: usize) -> Option<usize> {
        self.bones.get(index)?.children.iter().rev().copied().find(|&child| {
            self.bones[child].flags.contains(BoneFlags::CONNECTED)
        })
    }
}
