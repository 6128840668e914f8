use armature::{
    Armature, ArmatureObject, Bone, BoneFlags, DeformBuffers, DeformFlags, DeformOptions, DeformTarget, Rotation,
    SolveContext, TargetKind, VertexWeight, deform_vertices,
};
use glam::{Mat3, Quat, Vec3};
use serde_json::json;
use std::sync::Arc;

fn build_rig(segments: u32) -> Armature {
    let mut armature = Armature::new("arm_rig");
    let upper = armature
        .add_bone(Bone::new("upper", Vec3::ZERO, Vec3::new(0.0, 2.0, 0.0)), None)
        .expect("add upper");
    let mut lower = Bone::new("lower", Vec3::ZERO, Vec3::new(0.0, 2.0, 0.0));
    lower.flags = BoneFlags::CONNECTED;
    lower.segments = segments;
    armature.add_bone(lower, Some(upper)).expect("add lower");
    armature.update_rest_pose();
    armature
}

/// A column of points along the arm, weighted smoothly from the upper to the lower bone.
fn build_column(count: usize) -> (DeformTarget, Vec<Vec3>) {
    let mut target = DeformTarget::new("column", TargetKind::Mesh);
    target.vertex_groups = vec!["upper".to_string(), "lower".to_string()];

    let mut positions = Vec::with_capacity(count);
    let mut weights = Vec::with_capacity(count);
    for i in 0..count {
        let y = 4.0 * i as f32 / (count - 1).max(1) as f32;
        let t = (y - 1.5).clamp(0.0, 1.0);
        positions.push(Vec3::new(0.1, y, 0.0));
        weights.push(vec![VertexWeight::new(0, 1.0 - t), VertexWeight::new(1, t)]);
    }
    target.weights = Some(weights);
    (target, positions)
}

fn main() {
    env_logger::init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let mut positional = Vec::<String>::new();
    let mut quaternion = false;
    for arg in args {
        match arg.as_str() {
            "--quaternion" => quaternion = true,
            other => positional.push(other.to_string()),
        }
    }

    let angle: f32 = positional
        .first()
        .and_then(|s| s.parse().ok())
        .unwrap_or(90.0);
    let segments: u32 = positional.get(1).and_then(|s| s.parse().ok()).unwrap_or(1);
    let count: usize = positional.get(2).and_then(|s| s.parse().ok()).unwrap_or(9);

    let mut object = ArmatureObject::new("arm", Arc::new(build_rig(segments)));
    object
        .pose
        .channel_by_name_mut("lower")
        .expect("lower channel")
        .rotation = Rotation::Quaternion(Quat::from_rotation_x(angle.to_radians()));
    object.solve_pose(&mut SolveContext::new(0.0));
    object.update_deform_cache().expect("publish deform cache");

    let (target, rest) = build_column(count);
    let mut positions = rest.clone();
    let mut deform_mats = vec![Mat3::IDENTITY; count];

    let mut options = DeformOptions::from_armature(object.armature());
    options.flags.remove(DeformFlags::ENVELOPE);
    if quaternion {
        options.flags.insert(DeformFlags::QUATERNION);
    }

    let mut buffers = DeformBuffers::new(&mut positions);
    buffers.deform_mats = Some(deform_mats.as_mut_slice());
    deform_vertices(&object, &target, buffers, &options).expect("deform column");

    let channels: Vec<_> = object
        .pose
        .channels()
        .iter()
        .map(|channel| {
            json!({
                "name": channel.name(),
                "head": channel.pose_head().to_array(),
                "tail": channel.pose_tail().to_array(),
                "segments": channel.bbone_cache().map_or(1, |cache| cache.segments()),
            })
        })
        .collect();
    let points: Vec<_> = rest
        .iter()
        .zip(&positions)
        .zip(&deform_mats)
        .map(|((rest, deformed), mat)| {
            json!({
                "rest": rest.to_array(),
                "deformed": deformed.to_array(),
                "det": mat.determinant(),
            })
        })
        .collect();

    let out = json!({
        "angle": angle,
        "quaternion": quaternion,
        "channels": channels,
        "points": points,
    });
    println!("{}", serde_json::to_string_pretty(&out).expect("serialize dump"));
}
