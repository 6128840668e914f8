use crate::{
    Armature, ArmatureObject, Bone, BoneFlags, DeformCache, Error, PARALLEL_CHANNEL_THRESHOLD, PoseFlags, Rotation,
    SolveContext, armature_bounds,
};
use glam::{Mat4, Quat, Vec3};
use std::sync::Arc;

fn assert_vec3_approx(actual: Vec3, expected: Vec3) {
    assert!(
        actual.abs_diff_eq(expected, 1.0e-4),
        "expected {expected:?}, got {actual:?}"
    );
}

fn rig() -> Armature {
    let mut armature = Armature::new("rig");
    let root = armature
        .add_bone(Bone::new("root", Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0)), None)
        .unwrap();
    let mut arm = Bone::new("arm", Vec3::ZERO, Vec3::new(0.0, 2.0, 0.0));
    arm.flags = BoneFlags::CONNECTED;
    arm.segments = 3;
    armature.add_bone(arm, Some(root)).unwrap();
    let mut hidden = Bone::new("hidden", Vec3::new(-4.0, 0.0, 0.0), Vec3::new(-4.0, 1.0, 0.0));
    hidden.layer = 1 << 3;
    armature.add_bone(hidden, None).unwrap();
    armature.update_rest_pose();
    armature
}

fn solved_object() -> ArmatureObject {
    let mut object = ArmatureObject::new("rig_object", Arc::new(rig()));
    object.solve_pose(&mut SolveContext::default());
    object
}

#[test]
fn deform_cache_is_published_and_freed() {
    let object = solved_object();
    assert!(object.deform_cache().is_none());

    let published = object.update_deform_cache().unwrap();
    let loaded = object.deform_cache().unwrap();
    assert!(Arc::ptr_eq(&published, &loaded));
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded.topology_version, object.armature().topology_version());

    object.free_deform_cache();
    assert!(object.deform_cache().is_none());
    // Readers keep their snapshot.
    assert_eq!(loaded.len(), 3);
}

#[test]
fn cache_snapshots_channel_state() {
    let mut object = solved_object();
    object.pose.channel_mut(0).unwrap().rotation = Rotation::Quaternion(Quat::from_rotation_z(0.5));
    object.solve_pose(&mut SolveContext::default());
    let cache = object.update_deform_cache().unwrap();

    for (entry, channel) in cache.channels.iter().zip(object.pose.channels()) {
        assert_eq!(entry.chan_mat, channel.chan_mat());
        assert!(entry.deforms);
    }
    // B-Bone deform data is shared with the pose, not copied.
    let bbone = cache.channels[1].bbone.as_ref().unwrap();
    let own = object.pose.channel(1).unwrap().bbone_cache().unwrap().deform();
    assert!(Arc::ptr_eq(bbone, own));
    assert!(cache.channels[0].bbone.is_none());
}

#[test]
fn stale_pose_cannot_publish() {
    let mut object = ArmatureObject::new("rig_object", Arc::new(rig()));
    object.pose.flags.insert(PoseFlags::RECALC);
    assert!(matches!(
        object.update_deform_cache(),
        Err(Error::PoseNeedsRecalc { .. })
    ));
    assert!(object.deform_cache().is_none());

    object.rebuild_pose();
    assert!(object.update_deform_cache().is_ok());
}

#[test]
fn replacing_the_armature_drops_the_cache() {
    let mut object = solved_object();
    object.update_deform_cache().unwrap();

    let mut other = rig();
    other.add_bone(Bone::new("extra", Vec3::ZERO, Vec3::Z), None).unwrap();
    other.update_rest_pose();
    object.set_armature(Arc::new(other));

    assert!(object.deform_cache().is_none());
    assert!(object.pose.flags.contains(PoseFlags::RECALC));

    object.solve_pose(&mut SolveContext::default());
    assert_eq!(object.pose.len(), 4);
    assert_eq!(object.update_deform_cache().unwrap().len(), 4);
}

#[test]
fn custom_transforms_follow_their_target_across_reordering() {
    let mut object = solved_object();
    object.pose.channel_mut(0).unwrap().custom_transform = Some(1);

    // Same bones minus "arm", with "hidden" moved to the front.
    let mut reordered = Armature::new("rig");
    let mut hidden = Bone::new("hidden", Vec3::new(-4.0, 0.0, 0.0), Vec3::new(-4.0, 1.0, 0.0));
    hidden.layer = 1 << 3;
    reordered.add_bone(hidden, None).unwrap();
    reordered.add_bone(Bone::new("root", Vec3::ZERO, Vec3::Y), None).unwrap();
    reordered.update_rest_pose();

    object.set_armature(Arc::new(reordered));
    object.rebuild_pose();

    let root = object.pose.channel(1).unwrap();
    assert_eq!(root.name(), "root");
    // Its target "arm" is gone.
    assert_eq!(root.custom_transform, None);

    let mut object = solved_object();
    object.pose.channel_mut(1).unwrap().custom_transform = Some(2);
    let mut reordered = Armature::new("rig");
    let mut hidden = Bone::new("hidden", Vec3::new(-4.0, 0.0, 0.0), Vec3::new(-4.0, 1.0, 0.0));
    hidden.layer = 1 << 3;
    reordered.add_bone(hidden, None).unwrap();
    let root = reordered.add_bone(Bone::new("root", Vec3::ZERO, Vec3::Y), None).unwrap();
    let mut arm = Bone::new("arm", Vec3::ZERO, Vec3::new(0.0, 2.0, 0.0));
    arm.flags = BoneFlags::CONNECTED;
    reordered.add_bone(arm, Some(root)).unwrap();
    reordered.update_rest_pose();

    object.set_armature(Arc::new(reordered));
    object.rebuild_pose();

    let arm = object.pose.channel(2).unwrap();
    assert_eq!(arm.name(), "arm");
    assert_eq!(arm.custom_transform, Some(0));
    assert_eq!(object.pose.channel(0).unwrap().name(), "hidden");
}

#[test]
fn large_rigs_build_the_cache_in_parallel() {
    let mut armature = Armature::new("crowd");
    let count = PARALLEL_CHANNEL_THRESHOLD + 200;
    for i in 0..count {
        let x = i as f32;
        let mut bone = Bone::new(format!("bone{i}"), Vec3::new(x, 0.0, 0.0), Vec3::new(x, 1.0, 0.5));
        if i % 7 == 0 {
            bone.flags = BoneFlags::NO_DEFORM;
        }
        armature.add_bone(bone, None).unwrap();
    }
    armature.update_rest_pose();

    let mut object = ArmatureObject::new("crowd", Arc::new(armature));
    for (i, channel) in [0usize, 5, 600, count - 1].into_iter().enumerate() {
        object.pose.channel_mut(channel).unwrap().location = Vec3::splat(i as f32);
    }
    object.solve_pose(&mut SolveContext::default());

    let parallel = object.build_deform_cache(true);
    let sequential = object.build_deform_cache(false);
    assert_eq!(parallel.len(), count);
    assert_eq!(parallel, sequential);
    assert!(!parallel.channels[7].deforms);
    assert!(parallel.channels[8].deforms);
}

#[test]
fn rest_bounds() {
    let (min, max) = armature_bounds(&rig());
    assert_vec3_approx(min, Vec3::new(-4.0, 0.0, 0.0));
    assert_vec3_approx(max, Vec3::new(0.0, 3.0, 0.0));

    let (min, max) = armature_bounds(&Armature::new("empty"));
    assert_eq!(min, Vec3::splat(-1.0));
    assert_eq!(max, Vec3::splat(1.0));
}

#[test]
fn pose_bounds_follow_object_matrix_and_visibility() {
    let mut object = solved_object();
    object.matrix = Mat4::from_translation(Vec3::new(0.0, 0.0, 10.0));

    let (min, max) = object.pose_minmax(false).unwrap();
    assert_vec3_approx(min, Vec3::new(0.0, 0.0, 10.0));
    assert_vec3_approx(max, Vec3::new(0.0, 3.0, 10.0));

    let (min, _) = object.pose_minmax(true).unwrap();
    assert_vec3_approx(min, Vec3::new(-4.0, 0.0, 10.0));

    // The arm is drawn with the hidden bone's transform.
    object.pose.channel_mut(1).unwrap().custom_transform = Some(2);
    let (min, max) = object.pose_minmax(false).unwrap();
    assert_vec3_approx(min, Vec3::new(-4.0, 0.0, 10.0));
    assert_vec3_approx(max, Vec3::new(0.0, 1.0, 10.0));

    let empty = ArmatureObject::new("empty", Arc::new(Armature::new("empty")));
    assert!(empty.pose_minmax(true).is_none());
}

#[test]
fn world_to_pose_space() {
    let mut object = solved_object();
    object.matrix = Mat4::from_rotation_translation(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2), Vec3::X);

    assert_vec3_approx(object.loc_world_to_pose(Vec3::new(1.0, 2.0, 0.0)), Vec3::new(2.0, 0.0, 0.0));

    let world = Mat4::from_translation(Vec3::new(1.0, 2.0, 0.0));
    let pose = object.mat_world_to_pose(&world);
    assert!(
        (object.matrix * pose).abs_diff_eq(world, 1.0e-5),
        "{pose:?}"
    );
}

#[test]
fn deform_cache_can_be_built_for_an_unsolved_pose() {
    let object = ArmatureObject::new("rig_object", Arc::new(rig()));
    let cache = DeformCache::build(object.armature(), &object.pose, false);
    assert_eq!(cache.len(), 3);
    assert!(cache.channels.iter().all(|c| c.chan_mat == Mat4::IDENTITY));
}
