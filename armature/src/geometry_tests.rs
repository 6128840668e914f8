use crate::dual_quat::DualQuat;
use crate::geometry::{
    cubic_tangent_factor_circle, forward_diff_bezier, invert_or_identity, is_negative_mat4,
    is_orthonormal_mat3, mat4_to_size, minmax, normalize_mat4, orthogonalize_mat3_y,
};
use glam::{Mat3, Mat4, Quat, Vec3};

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

#[test]
fn circle_tangent_factor_covers_straight_opposite_and_right_angle() {
    assert_approx(cubic_tangent_factor_circle(Vec3::Y, Vec3::Y), 0.25);
    assert_approx(cubic_tangent_factor_circle(Vec3::Y, -Vec3::Y), 0.5);
    // Quarter circle: (1 - cos 45) / (2 sin^2 45).
    assert_approx(cubic_tangent_factor_circle(Vec3::Y, Vec3::X), 0.292_893);
}

#[test]
fn forward_differences_match_linear_bezier() {
    let mut out = [[0.0f32; 4]; 9];
    forward_diff_bezier([0.0, 1.0, 2.0, 3.0], 8, &mut out, 1);
    for (i, point) in out.iter().enumerate() {
        assert_approx(point[1], 3.0 * i as f32 / 8.0);
        assert_eq!(point[0], 0.0);
    }
}

#[test]
fn forward_differences_match_direct_evaluation() {
    let q = [0.0f32, 2.0, -1.0, 0.5];
    let mut out = [[0.0f32; 4]; 17];
    forward_diff_bezier(q, 16, &mut out, 2);
    for (i, point) in out.iter().enumerate() {
        let t = i as f32 / 16.0;
        let u = 1.0 - t;
        let expected = u * u * u * q[0] + 3.0 * u * u * t * q[1] + 3.0 * u * t * t * q[2] + t * t * t * q[3];
        assert_approx(point[2], expected);
    }
}

#[test]
fn singular_matrix_inverts_to_identity() {
    assert_eq!(invert_or_identity(&Mat4::ZERO), Mat4::IDENTITY);
    let m = Mat4::from_scale_rotation_translation(Vec3::splat(2.0), Quat::from_rotation_z(0.3), Vec3::X);
    let product = invert_or_identity(&m) * m;
    assert!(product.abs_diff_eq(Mat4::IDENTITY, 1.0e-5));
}

#[test]
fn size_and_normalize_ignore_translation() {
    let m = Mat4::from_scale_rotation_translation(
        Vec3::new(1.0, 2.0, 3.0),
        Quat::from_rotation_x(0.7),
        Vec3::new(4.0, 5.0, 6.0),
    );
    assert_vec3_approx(mat4_to_size(&m), Vec3::new(1.0, 2.0, 3.0));

    let n = normalize_mat4(&m);
    assert_vec3_approx(mat4_to_size(&n), Vec3::ONE);
    assert_vec3_approx(n.w_axis.truncate(), Vec3::new(4.0, 5.0, 6.0));
}

#[test]
fn negative_matrix_is_detected() {
    assert!(is_negative_mat4(&Mat4::from_scale(Vec3::new(-1.0, 1.0, 1.0))));
    assert!(!is_negative_mat4(&Mat4::from_rotation_y(2.0)));
}

#[test]
fn y_orthogonalization_keeps_the_y_direction() {
    let sheared = Mat3::from_cols(Vec3::new(1.0, 0.5, 0.0), Vec3::new(0.0, 3.0, 0.0), Vec3::Z);
    let m = orthogonalize_mat3_y(&sheared);
    assert!(is_orthonormal_mat3(&m));
    assert_vec3_approx(m.y_axis, Vec3::Y);
    assert!(m.determinant() > 0.0);
}

#[test]
fn minmax_accumulates_bounds() {
    let mut min = Vec3::splat(f32::MAX);
    let mut max = Vec3::splat(f32::MIN);
    minmax(&mut min, &mut max, Vec3::new(1.0, -2.0, 3.0));
    minmax(&mut min, &mut max, Vec3::new(-1.0, 2.0, 0.0));
    assert_eq!(min, Vec3::new(-1.0, -2.0, 0.0));
    assert_eq!(max, Vec3::new(1.0, 2.0, 3.0));
}

#[test]
fn rigid_dual_quat_transforms_like_its_matrix() {
    let rest = Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0));
    let deform = Mat4::from_rotation_translation(Quat::from_rotation_x(0.8), Vec3::new(0.5, -1.0, 2.0));
    let dq = DualQuat::from_deform_matrix(&rest, &deform);
    assert_eq!(dq.scale_weight, 0.0);

    let co = Vec3::new(0.3, 1.7, -0.4);
    let (out, mat) = dq.transform_point(co);
    assert_vec3_approx(out, deform.transform_point3(co));
    assert!(mat.abs_diff_eq(Mat3::from_mat4(deform), 1.0e-4));
}

#[test]
fn scaled_dual_quat_keeps_scale_separately() {
    let rest = Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0));
    let deform = rest * Mat4::from_scale(Vec3::new(1.0, 2.0, 1.0)) * invert_or_identity(&rest);
    let dq = DualQuat::from_deform_matrix(&rest, &deform);
    assert_eq!(dq.scale_weight, 1.0);

    let co = Vec3::new(1.0, 1.0, 0.0);
    let (out, _) = dq.transform_point(co);
    assert_vec3_approx(out, deform.transform_point3(co));
}

#[test]
fn blending_opposite_hemisphere_quaternions_takes_the_short_arc() {
    let a = DualQuat::from_rotation_translation(Quat::from_rotation_z(0.2), Vec3::ZERO);
    let mut b = DualQuat::from_rotation_translation(Quat::from_rotation_z(0.4), Vec3::ZERO);
    b.real = -b.real;
    b.dual = -b.dual;

    let mut sum = DualQuat::ZERO;
    sum.add_weighted(&a, 0.5);
    sum.add_weighted(&b, 0.5);
    sum.normalize_by(1.0);

    let (out, _) = sum.transform_point(Vec3::X);
    let expected = Quat::from_rotation_z(0.3) * Vec3::X;
    assert_vec3_approx(out, expected);
}
