use crate::geometry::{invert_or_identity, minmax};
use crate::{Armature, BBoneDeform, Bone, BoneFlags, DualQuat, Pose, PoseChannel, SolveContext};
use arc_swap::ArcSwapOption;
use glam::{Mat4, Vec3};
use rayon::prelude::*;
use std::sync::Arc;

/// Above this many channels the deform cache is built on the rayon pool.
pub const PARALLEL_CHANNEL_THRESHOLD: usize = 1024;

/// Per-channel snapshot used by the deformation engine.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelDeform {
    /// False for bones flagged `NO_DEFORM`.
    pub deforms: bool,
    /// `pose_mat * inverse(arm_mat)` at build time.
    pub chan_mat: Mat4,
    pub dual_quat: DualQuat,
    pub bbone: Option<Arc<BBoneDeform>>,
}

impl ChannelDeform {
    fn new(channel: &PoseChannel, bone: &Bone) -> Self {
        Self {
            deforms: !bone.flags.contains(BoneFlags::NO_DEFORM),
            chan_mat: channel.chan_mat(),
            dual_quat: DualQuat::from_deform_matrix(&bone.arm_mat(), &channel.chan_mat()),
            bbone: channel
                .bbone_cache()
                .filter(|cache| cache.segments() > 1)
                .map(|cache| Arc::clone(cache.deform())),
        }
    }
}

/// Deformation data of a solved pose, published as a whole.
#[derive(Clone, Debug, PartialEq)]
pub struct DeformCache {
    pub channels: Vec<ChannelDeform>,
    /// Armature topology the pose was solved against.
    pub topology_version: u64,
}

impl DeformCache {
    pub fn build(armature: &Armature, pose: &Pose, parallel: bool) -> Self {
        let pairs = pose.channels().iter().zip(armature.bones());
        let channels: Vec<ChannelDeform> = if parallel && pose.len() > PARALLEL_CHANNEL_THRESHOLD {
            pose.channels()
                .par_iter()
                .zip(armature.bones().par_iter())
                .map(|(channel, bone)| ChannelDeform::new(channel, bone))
                .collect()
        } else {
            pairs.map(|(channel, bone)| ChannelDeform::new(channel, bone)).collect()
        };

        Self {
            channels,
            topology_version: armature.topology_version(),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Armature object: shared rest data, its own pose, an object matrix and the published
/// deform cache.
pub struct ArmatureObject {
    pub name: String,
    data: Arc<Armature>,
    pub pose: Pose,
    pub matrix: Mat4,
    deform_cache: ArcSwapOption<DeformCache>,
}

impl std::fmt::Debug for ArmatureObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmatureObject")
            .field("name", &self.name)
            .field("armature", &self.data.name)
            .field("channels", &self.pose.len())
            .field("deform_cache", &self.deform_cache.load().is_some())
            .finish()
    }
}

impl ArmatureObject {
    pub fn new(name: impl Into<String>, data: Arc<Armature>) -> Self {
        let pose = Pose::from_armature(&data);
        Self {
            name: name.into(),
            data,
            pose,
            matrix: Mat4::IDENTITY,
            deform_cache: ArcSwapOption::empty(),
        }
    }

    pub fn armature(&self) -> &Arc<Armature> {
        &self.data
    }

    /// Swaps the rest data. The pose is flagged for a rebuild and the deform cache dropped.
    pub fn set_armature(&mut self, data: Arc<Armature>) {
        self.data = data;
        self.pose.flags.insert(crate::PoseFlags::RECALC);
        self.free_deform_cache();
    }

    pub fn rebuild_pose(&mut self) {
        self.pose.rebuild(&self.data);
    }

    pub fn solve_pose(&mut self, ctx: &mut SolveContext<'_>) {
        self.pose.solve(&self.data, ctx);
    }

    pub fn build_deform_cache(&self, parallel: bool) -> DeformCache {
        DeformCache::build(&self.data, &self.pose, parallel)
    }

    /// Builds the deform cache from the solved pose and publishes it.
    pub fn update_deform_cache(&self) -> Result<Arc<DeformCache>, crate::Error> {
        if self.pose.is_stale(&self.data) {
            log::error!(
                "pose of '{}' needs a rebuild before its deform cache can be updated",
                self.name
            );
            return Err(crate::Error::PoseNeedsRecalc {
                armature: self.data.name.clone(),
            });
        }

        let cache = Arc::new(self.build_deform_cache(true));
        self.deform_cache.store(Some(Arc::clone(&cache)));
        log::trace!(
            "published deform cache of '{}' ({} channels)",
            self.name,
            cache.len()
        );
        Ok(cache)
    }

    pub fn free_deform_cache(&self) {
        self.deform_cache.store(None);
    }

    /// Snapshot of the published deform cache.
    pub fn deform_cache(&self) -> Option<Arc<DeformCache>> {
        self.deform_cache.load_full()
    }

    /// Rest-pose bounds in object space, `(-1, 1)` for an armature without bones.
    pub fn bounds(&self) -> (Vec3, Vec3) {
        armature_bounds(&self.data)
    }

    /// World-space bounds of the solved pose. Channels with a custom transform use that
    /// channel's head and tail. Hidden bones are skipped unless `use_hidden` is set.
    pub fn pose_minmax(&self, use_hidden: bool) -> Option<(Vec3, Vec3)> {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        let mut changed = false;

        for (channel, bone) in self.pose.channels().iter().zip(self.data.bones()) {
            if !use_hidden && bone.layer & self.data.layer == 0 {
                continue;
            }
            let source = channel
                .custom_transform
                .and_then(|index| self.pose.channel(index))
                .unwrap_or(channel);
            minmax(&mut min, &mut max, self.matrix.transform_point3(source.pose_head()));
            minmax(&mut min, &mut max, self.matrix.transform_point3(source.pose_tail()));
            changed = true;
        }

        changed.then_some((min, max))
    }

    /// World-space matrix to the armature's pose space.
    pub fn mat_world_to_pose(&self, mat: &Mat4) -> Mat4 {
        invert_or_identity(&self.matrix) * *mat
    }

    pub fn loc_world_to_pose(&self, loc: Vec3) -> Vec3 {
        invert_or_identity(&self.matrix).transform_point3(loc)
    }

    /// Pulls protected channels from a proxy source object, see
    /// [`Pose::synchronize_from_proxy`].
    pub fn synchronize_from_proxy(&mut self, source: &mut ArmatureObject) -> Result<(), crate::Error> {
        self.pose
            .synchronize_from_proxy(&self.data, &self.name, &mut source.pose, &source.name)
    }
}

/// Rest bounds over every bone head and tail in object space.
pub fn armature_bounds(armature: &Armature) -> (Vec3, Vec3) {
    if armature.is_empty() {
        return (Vec3::splat(-1.0), Vec3::splat(1.0));
    }
    let mut min = Vec3::splat(f32::MAX);
    let mut max = Vec3::splat(f32::MIN);
    for bone in armature.bones() {
        minmax(&mut min, &mut max, bone.arm_head());
        minmax(&mut min, &mut max, bone.arm_tail());
    }
    (min, max)
}
