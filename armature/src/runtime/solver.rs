use crate::geometry::{invert_or_identity, mat4_translation};
use crate::{Armature, ArmatureFlags, BoneFlags, BoneParentTransform, ChannelFlags, Pose};
use glam::Mat4;

/// What a constraint evaluator sees of the channel it is solving.
#[derive(Copy, Clone, Debug)]
pub struct ConstraintContext<'a> {
    pub armature: &'a Armature,
    pub pose: &'a Pose,
    pub index: usize,
    pub time: f32,
}

/// Evaluates the constraint stack of a channel, in place on its pose-space matrix.
pub trait ConstraintSolver {
    fn solve(&mut self, ctx: &ConstraintContext<'_>, pose_mat: &mut Mat4);
}

/// Leaves every pose matrix unchanged.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoConstraints;

impl ConstraintSolver for NoConstraints {
    fn solve(&mut self, _ctx: &ConstraintContext<'_>, _pose_mat: &mut Mat4) {}
}

/// Channels solved together by a chain solver. `root` is where the solve is triggered
/// during the parent-first walk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chain {
    pub root: usize,
    pub members: Vec<usize>,
}

/// IK or spline IK: owns whole chains of channels instead of solving them one by one.
pub trait ChainSolver {
    /// Chains for this evaluation. Called after evaluation flags have been cleared.
    fn init_chains(&mut self, armature: &Armature, pose: &Pose, time: f32) -> Vec<Chain>;

    /// Solves every member of `chain`. Parents of `chain.root` are already solved.
    fn execute_chain(
        &mut self,
        armature: &Armature,
        pose: &mut Pose,
        chain: &Chain,
        constraints: &mut dyn ConstraintSolver,
        time: f32,
    );

    fn release(&mut self, _pose: &mut Pose) {}
}

/// Collaborators and settings of one [`Pose::solve`].
#[derive(Default)]
pub struct SolveContext<'a> {
    pub time: f32,
    pub constraints: Option<&'a mut dyn ConstraintSolver>,
    pub ik: Option<&'a mut dyn ChainSolver>,
    pub spline_ik: Option<&'a mut dyn ChainSolver>,
}

impl<'a> SolveContext<'a> {
    pub fn new(time: f32) -> Self {
        Self {
            time,
            ..Self::default()
        }
    }

    pub fn with_constraints(mut self, constraints: &'a mut dyn ConstraintSolver) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn with_ik(mut self, ik: &'a mut dyn ChainSolver) -> Self {
        self.ik = Some(ik);
        self
    }

    pub fn with_spline_ik(mut self, spline_ik: &'a mut dyn ChainSolver) -> Self {
        self.spline_ik = Some(spline_ik);
        self
    }
}

impl Pose {
    /// Solves the pose matrix and head/tail of a single channel. Its parent must be
    /// solved already.
    ///
    /// With `do_extra` unset the channel's own transform and constraints are skipped,
    /// which places the bone at its rest offset from the posed parent.
    pub fn where_is_bone(
        &mut self,
        armature: &Armature,
        index: usize,
        time: f32,
        do_extra: bool,
        constraints: &mut dyn ConstraintSolver,
    ) {
        let Some(bone) = armature.bone(index) else {
            return;
        };
        let Some(channel) = self.channel(index) else {
            return;
        };

        let chan_mat = if do_extra {
            channel.to_mat4(bone.flags)
        } else {
            Mat4::IDENTITY
        };
        let has_constraints = !channel.constraints.is_empty();
        let is_root = channel.parent().is_none();

        let mut pose_mat = BoneParentTransform::for_channel(armature, self, index).apply(&chan_mat);
        if is_root && !bone.flags.contains(BoneFlags::NO_CYCLIC_OFFSET) {
            pose_mat.w_axis += self.cyclic_offset.extend(0.0);
        }

        if do_extra && has_constraints {
            let head = pose_mat.w_axis;
            let ctx = ConstraintContext {
                armature,
                pose: self,
                index,
                time,
            };
            constraints.solve(&ctx, &mut pose_mat);
            // Constraints may not break a connected chain.
            if bone.flags.contains(BoneFlags::CONNECTED) {
                pose_mat.w_axis = head;
            }
        }

        let head = mat4_translation(&pose_mat);
        let tail = head + pose_mat.y_axis.truncate() * bone.length();

        let Some(channel) = self.channel_mut(index) else {
            return;
        };
        channel.chan_mat = chan_mat;
        channel.pose_mat = pose_mat;
        channel.pose_head = head;
        channel.pose_tail = tail;
    }

    /// Solves every channel, parents first, then refreshes channel matrices and B-Bone
    /// caches.
    pub fn solve(&mut self, armature: &Armature, ctx: &mut SolveContext<'_>) {
        if self.is_stale(armature) {
            self.rebuild(armature);
        }
        if armature.rest_dirty() {
            log::warn!(
                "solving pose of armature '{}' against an outdated rest pose",
                armature.name
            );
        }

        if armature.flags.contains(ArmatureFlags::REST_POSITION) {
            for (channel, bone) in self.channels_mut_internal().iter_mut().zip(armature.bones()) {
                channel.pose_mat = bone.arm_mat();
                channel.pose_head = bone.arm_head();
                channel.pose_tail = bone.arm_tail();
            }
        } else {
            self.solve_channels(armature, ctx);
        }

        for (channel, bone) in self.channels_mut_internal().iter_mut().zip(armature.bones()) {
            channel.chan_mat = channel.pose_mat * invert_or_identity(&bone.arm_mat());
        }
        for index in 0..self.len() {
            self.update_bbone_cache(armature, index);
        }

        log::trace!("solved pose of armature '{}'", armature.name);
    }

    fn solve_channels(&mut self, armature: &Armature, ctx: &mut SolveContext<'_>) {
        let time = ctx.time;
        for channel in self.channels_mut_internal() {
            channel.flags.remove(
                ChannelFlags::DONE
                    | ChannelFlags::IN_IK_CHAIN
                    | ChannelFlags::IK_TREE
                    | ChannelFlags::SPLINE_IK_TREE,
            );
        }

        let ik_chains = match ctx.ik.as_deref_mut() {
            Some(ik) => ik.init_chains(armature, self, time),
            None => Vec::new(),
        };
        let spline_chains = match ctx.spline_ik.as_deref_mut() {
            Some(spline_ik) => spline_ik.init_chains(armature, self, time),
            None => Vec::new(),
        };
        self.mark_chains(&ik_chains, ChannelFlags::IK_TREE);
        self.mark_chains(&spline_chains, ChannelFlags::SPLINE_IK_TREE);

        let mut no_constraints = NoConstraints;
        let constraints: &mut dyn ConstraintSolver = match ctx.constraints.as_deref_mut() {
            Some(constraints) => constraints,
            None => &mut no_constraints,
        };

        let order = self.order().to_vec();
        for index in order {
            let Some(flags) = self.channel(index).map(|channel| channel.flags) else {
                continue;
            };

            if flags.contains(ChannelFlags::IK_TREE) {
                if let Some(ik) = ctx.ik.as_deref_mut() {
                    for chain in ik_chains.iter().filter(|chain| chain.root == index) {
                        ik.execute_chain(armature, self, chain, &mut *constraints, time);
                        self.mark_done(chain);
                    }
                }
            }
            if flags.contains(ChannelFlags::SPLINE_IK_TREE) {
                if let Some(spline_ik) = ctx.spline_ik.as_deref_mut() {
                    for chain in spline_chains.iter().filter(|chain| chain.root == index) {
                        spline_ik.execute_chain(armature, self, chain, &mut *constraints, time);
                        self.mark_done(chain);
                    }
                }
            }

            let done = self
                .channel(index)
                .is_some_and(|channel| channel.flags.contains(ChannelFlags::DONE));
            if !done {
                self.where_is_bone(armature, index, time, true, &mut *constraints);
            }
        }

        if let Some(ik) = ctx.ik.as_deref_mut() {
            ik.release(self);
        }
        if let Some(spline_ik) = ctx.spline_ik.as_deref_mut() {
            spline_ik.release(self);
        }
    }

    fn mark_chains(&mut self, chains: &[Chain], tree_flag: ChannelFlags) {
        for chain in chains {
            if let Some(root) = self.channel_mut(chain.root) {
                root.flags.insert(tree_flag);
            }
            for &member in &chain.members {
                if let Some(channel) = self.channel_mut(member) {
                    channel.flags.insert(ChannelFlags::IN_IK_CHAIN);
                }
            }
        }
    }

    fn mark_done(&mut self, chain: &Chain) {
        for &index in std::iter::once(&chain.root).chain(&chain.members) {
            if let Some(channel) = self.channel_mut(index) {
                channel.flags.insert(ChannelFlags::DONE);
            }
        }
    }
}

/// Root of an IK chain ending at `index`. Without `use_tip` the chain starts at the
/// tip's parent. `chain_length` limits how many parents are walked (0 walks to the top
/// of the hierarchy).
pub fn ik_solver_find_root(pose: &Pose, index: usize, use_tip: bool, chain_length: usize) -> Option<usize> {
    let mut root = if use_tip {
        Some(index)
    } else {
        pose.channel(index)?.parent()
    };

    if let Some(mut current) = root {
        let mut count = 0;
        while let Some(parent) = pose.channel(current).and_then(|channel| channel.parent()) {
            count += 1;
            if count == chain_length {
                break;
            }
            current = parent;
        }
        root = Some(current);
    }
    root
}

/// Root of a spline IK chain ending at `index`, `chain_length` bones long (0 walks to
/// the top of the hierarchy).
pub fn splineik_solver_find_root(pose: &Pose, index: usize, chain_length: usize) -> Option<usize> {
    let mut current = index;
    pose.channel(current)?;
    let mut count = 0;
    while let Some(parent) = pose.channel(current).and_then(|channel| channel.parent()) {
        count += 1;
        if count == chain_length {
            break;
        }
        current = parent;
    }
    Some(current)
}
