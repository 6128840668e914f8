use crate::{Armature, BBoneCache, BBoneShape, BoneFlags, Properties, Rotation, RotationMode};
use glam::{Mat3, Mat4, Vec3};
use std::collections::HashMap;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ChannelFlags: u32 {
        /// Solved for the current evaluation.
        const DONE = 1 << 0;
        /// Member of an IK chain.
        const IN_IK_CHAIN = 1 << 1;
        /// Root of an IK tree, solved by the IK solver.
        const IK_TREE = 1 << 2;
        /// Root of a spline IK tree, solved by the spline IK solver.
        const SPLINE_IK_TREE = 1 << 3;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct PoseFlags: u32 {
        /// Channel structure is out of date and must be rebuilt before solving.
        const RECALC = 1 << 0;
        const WAS_REBUILT = 1 << 1;
    }
}

/// Constraint attached to a channel. Only its identity matters here; evaluation is up to
/// the [`crate::ConstraintSolver`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Constraint {
    pub name: String,
    pub kind: String,
    /// Target object name.
    pub target: Option<String>,
    /// Added locally on a proxy, kept when syncing from the proxy source.
    pub proxy_local: bool,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoseChannel {
    name: String,
    bone: usize,
    parent: Option<usize>,
    child: Option<usize>,
    bbone_prev: Option<usize>,
    bbone_next: Option<usize>,

    pub location: Vec3,
    pub rotation: Rotation,
    pub scale: Vec3,
    pub bbone: BBoneShape,

    pub custom_shape: Option<String>,
    /// Channel whose transform is used to draw the custom shape.
    pub custom_transform: Option<usize>,
    pub constraints: Vec<Constraint>,
    pub properties: Option<Properties>,
    pub flags: ChannelFlags,

    pub(crate) chan_mat: Mat4,
    pub(crate) pose_mat: Mat4,
    pub(crate) pose_head: Vec3,
    pub(crate) pose_tail: Vec3,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub(crate) bbone_cache: Option<BBoneCache>,
}

impl PoseChannel {
    pub fn new(name: impl Into<String>, bone: usize) -> Self {
        Self {
            name: name.into(),
            bone,
            parent: None,
            child: None,
            bbone_prev: None,
            bbone_next: None,
            location: Vec3::ZERO,
            rotation: Rotation::default(),
            scale: Vec3::ONE,
            bbone: BBoneShape::OFFSET,
            custom_shape: None,
            custom_transform: None,
            constraints: Vec::new(),
            properties: None,
            flags: ChannelFlags::empty(),
            chan_mat: Mat4::IDENTITY,
            pose_mat: Mat4::IDENTITY,
            pose_head: Vec3::ZERO,
            pose_tail: Vec3::ZERO,
            bbone_cache: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bone_index(&self) -> usize {
        self.bone
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Connected child, if any.
    pub fn child(&self) -> Option<usize> {
        self.child
    }

    pub fn bbone_prev(&self) -> Option<usize> {
        self.bbone_prev
    }

    pub fn bbone_next(&self) -> Option<usize> {
        self.bbone_next
    }

    /// `pose_mat * inverse(arm_mat)` after a solve; the local channel matrix while solving.
    pub fn chan_mat(&self) -> Mat4 {
        self.chan_mat
    }

    pub fn pose_mat(&self) -> Mat4 {
        self.pose_mat
    }

    pub fn pose_head(&self) -> Vec3 {
        self.pose_head
    }

    pub fn pose_tail(&self) -> Vec3 {
        self.pose_tail
    }

    pub fn bbone_cache(&self) -> Option<&BBoneCache> {
        self.bbone_cache.as_ref()
    }

    /// Clears every animated value, keeping the rotation mode.
    pub fn rest(&mut self) {
        self.location = Vec3::ZERO;
        self.rotation = Rotation::identity(self.rotation.mode());
        self.scale = Vec3::ONE;
        self.bbone = BBoneShape::OFFSET;
    }

    /// Switches the rotation representation without changing the orientation.
    pub fn set_rotation_mode(&mut self, mode: RotationMode) {
        self.rotation = self.rotation.converted(mode);
    }

    /// Local matrix from location, rotation and scale. Connected bones ignore location.
    pub fn to_mat4(&self, bone_flags: BoneFlags) -> Mat4 {
        let rot_scale = self.rotation.to_mat3() * Mat3::from_diagonal(self.scale);
        let mut mat = Mat4::from_mat3(rot_scale);
        if !bone_flags.contains(BoneFlags::CONNECTED) {
            mat.w_axis = self.location.extend(1.0);
        }
        mat
    }

    /// Sets location, rotation (in the current mode) and scale from a local matrix. A
    /// negative determinant flips the sign of the scale and of the rotation columns.
    pub fn apply_mat4(&mut self, mat: &Mat4) {
        let m3 = Mat3::from_mat4(*mat);
        let mut scale = Vec3::new(
            m3.x_axis.length(),
            m3.y_axis.length(),
            m3.z_axis.length(),
        );
        let mut rot = crate::geometry::normalize_mat3(&m3);
        if m3.determinant() < 0.0 {
            scale = -scale;
            rot = rot * -1.0;
        }

        self.location = mat.w_axis.truncate();
        self.scale = scale;
        self.rotation = Rotation::from_mat3(&rot, self.rotation.mode());
    }

    /// Copies the B-Bone runtime cache of `other`, or drops ours when `other` has none.
    pub fn copy_bbone_cache_from(&mut self, other: &PoseChannel) {
        match &other.bbone_cache {
            Some(cache) if cache.segments() > 1 => match &mut self.bbone_cache {
                Some(own) => own.clone_from(cache),
                None => self.bbone_cache = Some(cache.clone()),
            },
            _ => self.free_bbone_cache(),
        }
    }

    pub fn free_bbone_cache(&mut self) {
        self.bbone_cache = None;
    }

    /// Copies the solved matrices, head/tail and B-Bone cache of `other`.
    pub fn copy_result_from(&mut self, other: &PoseChannel) {
        self.chan_mat = other.chan_mat;
        self.pose_mat = other.pose_mat;
        self.pose_head = other.pose_head;
        self.pose_tail = other.pose_tail;
        self.copy_bbone_cache_from(other);
    }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pose {
    channels: Vec<PoseChannel>,
    channel_index: HashMap<String, usize>,
    order: Vec<usize>,
    /// Added to root bones without `NO_CYCLIC_OFFSET`.
    pub cyclic_offset: Vec3,
    pub flags: PoseFlags,
    topology_version: Option<u64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::new()
    }
}

impl Pose {
    /// Empty pose, flagged for a rebuild.
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            channel_index: HashMap::new(),
            order: Vec::new(),
            cyclic_offset: Vec3::ZERO,
            flags: PoseFlags::RECALC,
            topology_version: None,
        }
    }

    pub fn from_armature(armature: &Armature) -> Self {
        let mut pose = Self::new();
        pose.rebuild(armature);
        pose
    }

    pub fn channels(&self) -> &[PoseChannel] {
        &self.channels
    }

    pub fn channel(&self, index: usize) -> Option<&PoseChannel> {
        self.channels.get(index)
    }

    pub fn channel_mut(&mut self, index: usize) -> Option<&mut PoseChannel> {
        self.channels.get_mut(index)
    }

    pub(crate) fn channels_mut_internal(&mut self) -> &mut [PoseChannel] {
        &mut self.channels
    }

    pub fn find_channel(&self, name: &str) -> Option<usize> {
        self.channel_index.get(name).copied()
    }

    pub fn channel_by_name_mut(&mut self, name: &str) -> Option<&mut PoseChannel> {
        let index = self.find_channel(name)?;
        self.channels.get_mut(index)
    }

    /// Parent-before-child solve order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// True when the channel tree no longer mirrors `armature`.
    pub fn is_stale(&self, armature: &Armature) -> bool {
        self.flags.contains(PoseFlags::RECALC)
            || self.topology_version != Some(armature.topology_version())
            || self.channels.len() != armature.len()
    }

    /// Makes the channel tree mirror the bone tree. Channels are matched by name so their
    /// animated values survive; channels without a bone are dropped.
    pub fn rebuild(&mut self, armature: &Armature) {
        let old_names: Vec<String> = self.channels.iter().map(|channel| channel.name.clone()).collect();
        let mut old: HashMap<String, PoseChannel> = std::mem::take(&mut self.channels)
            .into_iter()
            .map(|channel| (channel.name.clone(), channel))
            .collect();

        let mut channels = Vec::with_capacity(armature.len());
        for (index, bone) in armature.bones().iter().enumerate() {
            let mut channel = old
                .remove(bone.name())
                .unwrap_or_else(|| PoseChannel::new(bone.name(), index));
            channel.bone = index;
            channel.parent = bone.parent();
            channel.child = armature.connected_child(index);
            channel.bbone_prev = bone.bbone_prev.filter(|&i| i < armature.len());
            channel.bbone_next = bone.bbone_next.filter(|&i| i < armature.len());
            channels.push(channel);
        }

        if !old.is_empty() {
            log::debug!(
                "dropping {} pose channel(s) without a bone in armature '{}'",
                old.len(),
                armature.name
            );
        }

        self.channel_index = channels
            .iter()
            .enumerate()
            .map(|(index, channel)| (channel.name.clone(), index))
            .collect();

        // Custom transforms follow their target channel by name.
        for channel in &mut channels {
            channel.custom_transform = channel
                .custom_transform
                .and_then(|old| old_names.get(old))
                .and_then(|name| self.channel_index.get(name).copied());
        }
        self.channels = channels;
        self.order = armature.pre_order();
        self.topology_version = Some(armature.topology_version());
        self.flags.remove(PoseFlags::RECALC);
        self.flags.insert(PoseFlags::WAS_REBUILT);

        log::debug!(
            "rebuilt pose for armature '{}' ({} channels)",
            armature.name,
            self.channels.len()
        );
    }

    /// Copies solved results channel by channel (matched by name) from another pose of
    /// the same armature. Returns the number of channels without a counterpart.
    pub fn copy_result_from(&mut self, other: &Pose) -> usize {
        let mut unmatched = 0;
        for channel in &mut self.channels {
            match other.find_channel(&channel.name).and_then(|i| other.channels.get(i)) {
                Some(src) => channel.copy_result_from(src),
                None => unmatched += 1,
            }
        }
        unmatched
    }

    /// Clears all animated values.
    pub fn rest(&mut self) {
        self.cyclic_offset = Vec3::ZERO;
        for channel in &mut self.channels {
            channel.rest();
        }
    }

    /// Overwrites channels on protected layers with the proxy source's values. Channels on
    /// other layers only pick up the custom shape and property layout.
    ///
    /// Fails without touching either pose when a protected channel is missing from the
    /// source. The source pose is reset to rest.
    pub fn synchronize_from_proxy(
        &mut self,
        armature: &Armature,
        object_name: &str,
        source: &mut Pose,
        source_name: &str,
    ) -> Result<(), crate::Error> {
        let is_protected = |channel: &PoseChannel| {
            armature
                .bone(channel.bone)
                .is_some_and(|bone| bone.layer & armature.layer_protected != 0)
        };

        let mut missing = Vec::new();
        for channel in &self.channels {
            if is_protected(channel) && source.find_channel(&channel.name).is_none() {
                log::error!(
                    "failed to sync proxy armature because '{source_name}' is missing pose channel '{}'",
                    channel.name
                );
                missing.push(channel.name.clone());
            }
        }
        if !missing.is_empty() {
            return Err(crate::Error::ProxyMissingChannels {
                object: source_name.to_string(),
                channels: missing,
            });
        }

        source.rest();

        for index in 0..self.channels.len() {
            let Some(src) = source
                .find_channel(&self.channels[index].name)
                .and_then(|i| source.channels.get(i))
            else {
                continue;
            };

            if is_protected(&self.channels[index]) {
                let own = &self.channels[index];
                let mut synced = src.clone();
                synced.name = own.name.clone();
                synced.bone = own.bone;
                synced.parent = own.parent;
                synced.child = own.child;
                synced.custom_transform = own.custom_transform;
                synced.bbone_prev = own.bbone_prev;
                synced.bbone_next = own.bbone_next;

                if let (Some(props), Some(own_props)) = (&mut synced.properties, &own.properties) {
                    props.sync_values_from(own_props);
                }

                // Source constraints first, then our proxy-local ones.
                synced
                    .constraints
                    .extend(own.constraints.iter().filter(|c| c.proxy_local).cloned());
                for constraint in &mut synced.constraints {
                    if constraint.target.as_deref() == Some(source_name) {
                        constraint.target = Some(object_name.to_string());
                    }
                }

                self.channels[index] = synced;
            } else {
                let custom_transform = src
                    .custom_transform
                    .and_then(|i| source.channels.get(i))
                    .and_then(|tx| self.find_channel(&tx.name));
                let properties = src.properties.clone().map(|mut props| {
                    if let Some(own_props) = &self.channels[index].properties {
                        props.sync_values_from(own_props);
                    }
                    props
                });

                let own = &mut self.channels[index];
                own.custom_shape = src.custom_shape.clone();
                if src.custom_transform.is_some() {
                    own.custom_transform = custom_transform;
                }
                own.properties = properties;
            }
        }

        log::debug!("synchronized '{object_name}' from proxy source '{source_name}'");
        Ok(())
    }
}
