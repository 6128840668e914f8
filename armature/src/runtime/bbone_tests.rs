use crate::{
    Armature, BBoneHandleType, BBoneSplineParameters, Bone, BoneFlags, MAX_BBONE_SUBDIVISIONS, Pose,
    Rotation, SolveContext, compute_bbone_handles, compute_bbone_segments,
};
use glam::{Mat3, Mat4, Quat, Vec3};
use rstest::rstest;
use std::sync::Arc;

fn assert_approx(actual: f32, expected: f32) {
    let diff = (actual - expected).abs();
    assert!(
        diff <= 1.0e-4,
        "expected {expected}, got {actual} (diff {diff})"
    );
}

fn assert_vec3_approx(actual: Vec3, expected: Vec3) {
    assert!(
        actual.abs_diff_eq(expected, 1.0e-4),
        "expected {expected:?}, got {actual:?}"
    );
}

fn single_bbone(segments: u32) -> Armature {
    let mut armature = Armature::new("rig");
    let mut bone = Bone::new("spine", Vec3::ZERO, Vec3::new(0.0, 4.0, 0.0));
    bone.segments = segments;
    armature.add_bone(bone, None).unwrap();
    armature.update_rest_pose();
    armature
}

fn solved(armature: &Armature) -> Pose {
    let mut pose = Pose::from_armature(armature);
    pose.solve(armature, &mut SolveContext::default());
    pose
}

#[test]
fn straight_bone_is_split_into_equal_segments() {
    let armature = single_bbone(4);
    let pose = solved(&armature);
    let cache = pose.channel(0).unwrap().bbone_cache().unwrap();

    assert_eq!(cache.segments(), 4);
    for (a, segment) in cache.rest_segments().iter().enumerate() {
        assert_vec3_approx(segment.w_axis.truncate(), Vec3::new(0.0, a as f32, 0.0));
        assert!(Mat3::from_mat4(*segment).abs_diff_eq(Mat3::IDENTITY, 1.0e-4));
    }
    assert_eq!(cache.rest_segments(), cache.pose_segments());
}

#[test]
fn plain_bone_has_no_cache() {
    let armature = single_bbone(1);
    let pose = solved(&armature);
    assert!(pose.channel(0).unwrap().bbone_cache().is_none());
}

#[test]
fn rest_pose_deform_matrices_are_identity() {
    let armature = single_bbone(3);
    let pose = solved(&armature);
    let deform = pose.channel(0).unwrap().bbone_cache().unwrap().deform();

    assert_eq!(deform.mats.len(), 4);
    assert_eq!(deform.dual_quats.len(), 3);
    assert!(deform.mats[0].abs_diff_eq(Mat4::IDENTITY, 1.0e-5));
    for mat in &deform.mats[1..] {
        assert!(mat.abs_diff_eq(Mat4::IDENTITY, 1.0e-4), "{mat:?}");
    }
}

#[test]
fn segment_lookup_clamps_past_the_ends() {
    let armature = single_bbone(4);
    let pose = solved(&armature);
    let deform = pose.channel(0).unwrap().bbone_cache().unwrap().deform();

    assert_eq!(deform.segment_index(Vec3::new(0.0, 2.5, 0.0), 4.0), 2);
    assert_eq!(deform.segment_index(Vec3::new(0.3, -1.0, 0.0), 4.0), 0);
    assert_eq!(deform.segment_index(Vec3::new(0.0, 9.0, 0.0), 4.0), 3);
}

#[test]
fn cache_follows_segment_count_changes() {
    let mut armature = single_bbone(4);
    let mut pose = solved(&armature);

    armature.bone_mut(0).unwrap().segments = 2;
    armature.update_rest_pose();
    pose.solve(&armature, &mut SolveContext::default());
    assert_eq!(pose.channel(0).unwrap().bbone_cache().unwrap().segments(), 2);

    armature.bone_mut(0).unwrap().segments = 1;
    armature.update_rest_pose();
    pose.solve(&armature, &mut SolveContext::default());
    assert!(pose.channel(0).unwrap().bbone_cache().is_none());
}

#[test]
fn each_solve_publishes_a_new_deform_block() {
    let armature = single_bbone(2);
    let mut pose = solved(&armature);
    let first = Arc::clone(pose.channel(0).unwrap().bbone_cache().unwrap().deform());
    pose.solve(&armature, &mut SolveContext::default());
    let second = pose.channel(0).unwrap().bbone_cache().unwrap().deform();
    assert!(!Arc::ptr_eq(&first, second));
    assert_eq!(*first, **second);
}

#[test]
fn segments_are_clamped_to_the_maximum() {
    let params = BBoneSplineParameters {
        segments: 100,
        length: 2.0,
        ease1: 1.0,
        ease2: 1.0,
        ..BBoneSplineParameters::default()
    };
    let segments = compute_bbone_segments(&params);
    assert_eq!(segments.len(), MAX_BBONE_SUBDIVISIONS);
    assert_vec3_approx(
        segments[MAX_BBONE_SUBDIVISIONS - 1].w_axis.truncate(),
        Vec3::new(0.0, 2.0 - 2.0 / 32.0, 0.0),
    );
}

#[test]
fn handles_without_neighbors_point_along_the_bone() {
    let params = BBoneSplineParameters {
        segments: 4,
        length: 3.0,
        ease1: 1.0,
        ease2: 0.5,
        roll1: 0.2,
        curve_in_x: 0.5,
        curve_out_y: -0.25,
        ..BBoneSplineParameters::default()
    };

    let bare = compute_bbone_handles(&params, false, false);
    assert_vec3_approx(bare.h1, Vec3::Y);
    assert_vec3_approx(bare.h2, Vec3::Y);

    // Straight tangents: a third of the length per unit of ease.
    let full = compute_bbone_handles(&params, true, true);
    assert_vec3_approx(full.h1, Vec3::new(0.5, 1.0, 0.0));
    assert_vec3_approx(full.h2, Vec3::new(0.0, -0.5, -0.25));
    assert_approx(full.roll1, 0.2);
    assert_approx(full.roll2, 0.0);
}

#[test]
fn curve_offsets_bend_the_posed_segments() {
    let armature = single_bbone(4);
    let mut pose = Pose::from_armature(&armature);
    pose.channel_mut(0).unwrap().bbone.curve_in_x = 1.0;
    pose.channel_mut(0).unwrap().bbone.curve_out_x = 1.0;
    pose.solve(&armature, &mut SolveContext::default());

    let cache = pose.channel(0).unwrap().bbone_cache().unwrap();
    let pose_segments = cache.pose_segments();
    assert_vec3_approx(pose_segments[0].w_axis.truncate(), Vec3::ZERO);
    assert!(pose_segments[2].w_axis.x > 0.1);
    // Rest shape is unaffected by channel offsets.
    assert_approx(cache.rest_segments()[2].w_axis.x, 0.0);
}

#[test]
fn scale_in_and_out_widen_the_segments() {
    let armature = single_bbone(2);
    let mut pose = Pose::from_armature(&armature);
    pose.channel_mut(0).unwrap().bbone.scale_in = 2.0;
    pose.solve(&armature, &mut SolveContext::default());

    let segments = pose.channel(0).unwrap().bbone_cache().unwrap().pose_segments();
    assert_approx(segments[0].x_axis.truncate().length(), 2.0);
    assert_approx(segments[1].x_axis.truncate().length(), 1.5);
    assert_approx(segments[0].y_axis.truncate().length(), 1.0);
}

#[test]
fn rotated_bbone_without_curvature_moves_rigidly() {
    let armature = single_bbone(3);
    let mut pose = Pose::from_armature(&armature);
    let rotation = Quat::from_rotation_z(0.9);
    pose.channel_mut(0).unwrap().rotation = Rotation::Quaternion(rotation);
    pose.solve(&armature, &mut SolveContext::default());

    let channel = pose.channel(0).unwrap();
    for mat in &channel.bbone_cache().unwrap().deform().mats[1..] {
        assert!(mat.abs_diff_eq(channel.chan_mat(), 1.0e-4));
    }
}

#[test]
fn automatic_handles_use_connected_neighbors() {
    let mut armature = Armature::new("rig");
    let a = armature.add_bone(Bone::new("A", Vec3::ZERO, Vec3::Y), None).unwrap();
    let mut b = Bone::new("B", Vec3::ZERO, Vec3::Y);
    b.flags = BoneFlags::CONNECTED;
    b.segments = 3;
    let b = armature.add_bone(b, Some(a)).unwrap();
    let mut c = Bone::new("C", Vec3::ZERO, Vec3::X);
    c.flags = BoneFlags::CONNECTED;
    let c = armature.add_bone(c, Some(b)).unwrap();
    let loose = armature.add_bone(Bone::new("D", Vec3::X, Vec3::ONE), Some(b)).unwrap();
    armature.update_rest_pose();

    let pose = solved(&armature);
    assert_eq!(pose.bbone_handles(&armature, b), (Some(a), Some(c)));
    assert_eq!(pose.bbone_handles(&armature, loose), (None, None));

    let params = pose.bbone_spline_params(&armature, b, false);
    assert!(params.use_prev && params.use_next);
    assert!(!params.prev_bbone && !params.next_bbone);
    // Previous handle is the parent's head, one unit below this bone's head.
    assert_vec3_approx(params.prev_h, Vec3::new(0.0, -1.0, 0.0));

    // The bent end handle turns the last segment towards the child.
    let segments = pose.channel(b).unwrap().bbone_cache().unwrap().pose_segments();
    assert!(segments[2].y_axis.x > 0.0);
    assert!(segments[0].y_axis.y > 0.9);
}

/// Three loose bones: "prev" leaning towards +X, "mid" (the B-Bone) from (0, 2, 0) to
/// (0, 4, 0) with explicit handles, "next" pointing along +X from (0, 5, 0).
fn explicit_handle_rig(handle_type: BBoneHandleType) -> Armature {
    let mut armature = Armature::new("rig");
    let prev = armature
        .add_bone(Bone::new("prev", Vec3::ZERO, Vec3::new(1.0, 1.0, 0.0)), None)
        .unwrap();
    let mut mid = Bone::new("mid", Vec3::new(0.0, 2.0, 0.0), Vec3::new(0.0, 4.0, 0.0));
    mid.segments = 4;
    mid.bbone_prev_type = handle_type;
    mid.bbone_next_type = handle_type;
    let mid = armature.add_bone(mid, None).unwrap();
    let next = armature
        .add_bone(Bone::new("next", Vec3::new(0.0, 5.0, 0.0), Vec3::new(2.0, 5.0, 0.0)), None)
        .unwrap();

    let bone = armature.bone_mut(mid).unwrap();
    bone.bbone_prev = Some(prev);
    bone.bbone_next = Some(next);
    armature.update_rest_pose();
    armature
}

#[rstest]
#[case::absolute(BBoneHandleType::Absolute, Vec3::new(0.0, -2.0, 0.0), Vec3::new(2.0, 3.0, 0.0))]
#[case::relative(BBoneHandleType::Relative, Vec3::ZERO, Vec3::new(0.0, 2.0, 0.0))]
#[case::tangent(BBoneHandleType::Tangent, Vec3::new(-1.0, -1.0, 0.0), Vec3::new(2.0, 2.0, 0.0))]
fn explicit_handles_at_rest(#[case] handle_type: BBoneHandleType, #[case] prev_h: Vec3, #[case] next_h: Vec3) {
    let armature = explicit_handle_rig(handle_type);
    let pose = solved(&armature);
    assert_eq!(pose.bbone_handles(&armature, 1), (Some(0), Some(2)));

    let params = pose.bbone_spline_params(&armature, 1, true);
    assert!(params.use_prev && params.use_next);
    assert!(!params.prev_bbone && !params.next_bbone);
    assert_vec3_approx(params.prev_h, prev_h);
    assert_vec3_approx(params.next_h, next_h);
}

// "prev" is moved by (0, 0, 1) and "next" by (0, 0, -0.5); both lie in the XY plane with
// no roll, so their local Z matches armature Z.
#[rstest]
#[case::absolute(BBoneHandleType::Absolute, Vec3::new(0.0, -2.0, 1.0), Vec3::new(2.0, 3.0, -0.5))]
#[case::relative(BBoneHandleType::Relative, Vec3::new(0.0, 0.0, -1.0), Vec3::new(0.0, 2.0, -0.5))]
#[case::tangent(BBoneHandleType::Tangent, Vec3::new(-1.0, -1.0, 0.0), Vec3::new(2.0, 2.0, 0.0))]
fn explicit_handles_follow_posed_neighbors(
    #[case] handle_type: BBoneHandleType,
    #[case] prev_h: Vec3,
    #[case] next_h: Vec3,
) {
    let armature = explicit_handle_rig(handle_type);
    let mut pose = Pose::from_armature(&armature);
    pose.channel_mut(0).unwrap().location = Vec3::new(0.0, 0.0, 1.0);
    pose.channel_mut(2).unwrap().location = Vec3::new(0.0, 0.0, -0.5);
    pose.solve(&armature, &mut SolveContext::default());

    assert_vec3_approx(pose.channel(0).unwrap().pose_head(), Vec3::new(0.0, 0.0, 1.0));
    assert_vec3_approx(pose.channel(2).unwrap().pose_tail(), Vec3::new(2.0, 5.0, -0.5));

    let params = pose.bbone_spline_params(&armature, 1, false);
    assert_vec3_approx(params.prev_h, prev_h);
    assert_vec3_approx(params.next_h, next_h);
}

#[test]
fn tangent_handles_use_the_neighbor_direction() {
    let armature = explicit_handle_rig(BBoneHandleType::Tangent);
    let mut pose = Pose::from_armature(&armature);
    // Swing "prev" so it points straight up the chain.
    pose.channel_mut(0).unwrap().rotation =
        Rotation::Quaternion(Quat::from_rotation_z(std::f32::consts::FRAC_PI_4));
    pose.solve(&armature, &mut SolveContext::default());

    let prev = pose.channel(0).unwrap();
    assert_vec3_approx(prev.pose_tail() - prev.pose_head(), Vec3::new(0.0, 2.0f32.sqrt(), 0.0));

    let params = pose.bbone_spline_params(&armature, 1, false);
    assert_vec3_approx(params.prev_h, Vec3::new(0.0, -(2.0f32.sqrt()), 0.0));
    let handles = compute_bbone_handles(&params, false, false);
    assert_vec3_approx(handles.h1, Vec3::Y);
}

#[test]
fn automatic_handles_ignore_explicit_neighbors() {
    let armature = explicit_handle_rig(BBoneHandleType::Auto);
    let pose = solved(&armature);
    assert_eq!(pose.bbone_handles(&armature, 1), (None, None));
}

fn rolled_chain(add_parent_end_roll: bool) -> Armature {
    let mut armature = Armature::new("rig");
    let mut upper = Bone::new("upper", Vec3::ZERO, Vec3::Y);
    upper.segments = 2;
    upper.bbone.roll_out = 0.3;
    let upper = armature.add_bone(upper, None).unwrap();
    let mut lower = Bone::new("lower", Vec3::ZERO, Vec3::Y);
    lower.segments = 3;
    lower.bbone.roll_in = 0.1;
    lower.flags = BoneFlags::CONNECTED;
    if add_parent_end_roll {
        lower.flags |= BoneFlags::ADD_PARENT_END_ROLL;
    }
    armature.add_bone(lower, Some(upper)).unwrap();
    armature.update_rest_pose();
    armature
}

fn segment_roll(segment: &Mat4) -> f32 {
    (-segment.x_axis.z).atan2(segment.x_axis.x)
}

#[rstest]
#[case::own_roll_only(false, 0.1, 0.1)]
#[case::with_parent_end_roll(true, 0.4, 0.6)]
fn parent_end_roll_adds_to_the_start_roll(
    #[case] add_parent_end_roll: bool,
    #[case] rest_roll: f32,
    #[case] pose_roll: f32,
) {
    let armature = rolled_chain(add_parent_end_roll);
    let mut pose = Pose::from_armature(&armature);
    pose.channel_mut(0).unwrap().bbone.roll_out = 0.2;
    pose.solve(&armature, &mut SolveContext::default());

    assert_approx(pose.bbone_spline_params(&armature, 1, true).roll1, rest_roll);
    assert_approx(pose.bbone_spline_params(&armature, 1, false).roll1, pose_roll);

    let cache = pose.channel(1).unwrap().bbone_cache().unwrap();
    assert_approx(segment_roll(&cache.rest_segments()[0]), rest_roll);
    assert_approx(segment_roll(&cache.pose_segments()[0]), pose_roll);
}
