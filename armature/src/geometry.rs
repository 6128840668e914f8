use glam::{Mat3, Mat4, Quat, Vec3};

pub(crate) fn mat4_from_mat3_translation(rotation: Mat3, translation: Vec3) -> Mat4 {
    let mut out = Mat4::from_mat3(rotation);
    out.w_axis = translation.extend(1.0);
    out
}

pub(crate) fn mat4_translation(m: &Mat4) -> Vec3 {
    m.w_axis.truncate()
}

/// Length of each basis column (always positive, reflections are not detected).
pub fn mat4_to_size(m: &Mat4) -> Vec3 {
    Vec3::new(
        m.x_axis.truncate().length(),
        m.y_axis.truncate().length(),
        m.z_axis.truncate().length(),
    )
}

/// Unit-length basis columns, translation untouched. Zero columns stay zero.
pub fn normalize_mat4(m: &Mat4) -> Mat4 {
    let mut out = *m;
    out.x_axis = m.x_axis.truncate().normalize_or_zero().extend(m.x_axis.w);
    out.y_axis = m.y_axis.truncate().normalize_or_zero().extend(m.y_axis.w);
    out.z_axis = m.z_axis.truncate().normalize_or_zero().extend(m.z_axis.w);
    out
}

pub(crate) fn normalize_mat3(m: &Mat3) -> Mat3 {
    Mat3::from_cols(
        m.x_axis.normalize_or_zero(),
        m.y_axis.normalize_or_zero(),
        m.z_axis.normalize_or_zero(),
    )
}

pub(crate) fn is_orthonormal_mat3(m: &Mat3) -> bool {
    const EPS: f32 = 1.0e-5;
    let axes = [m.x_axis, m.y_axis, m.z_axis];
    axes.iter().all(|a| (a.length_squared() - 1.0).abs() <= EPS)
        && axes[0].dot(axes[1]).abs() <= EPS
        && axes[1].dot(axes[2]).abs() <= EPS
        && axes[0].dot(axes[2]).abs() <= EPS
}

pub fn is_negative_mat4(m: &Mat4) -> bool {
    Mat3::from_mat4(*m).determinant() < 0.0
}

/// Inverse of `m`, or identity when `m` is singular.
pub fn invert_or_identity(m: &Mat4) -> Mat4 {
    let det = m.determinant();
    if !det.is_finite() || det.abs() <= f32::MIN_POSITIVE {
        log::trace!("singular 4x4 matrix, using identity as inverse");
        return Mat4::IDENTITY;
    }
    m.inverse()
}

pub(crate) fn invert_mat3_or_identity(m: &Mat3) -> Mat3 {
    let det = m.determinant();
    if !det.is_finite() || det.abs() <= f32::MIN_POSITIVE {
        return Mat3::IDENTITY;
    }
    m.inverse()
}

/// Orthonormal basis that keeps the direction of the Y column.
pub(crate) fn orthogonalize_mat3_y(m: &Mat3) -> Mat3 {
    let y = m.y_axis.try_normalize().unwrap_or(Vec3::Y);
    let z = m
        .x_axis
        .cross(y)
        .try_normalize()
        .unwrap_or_else(|| y.any_orthonormal_vector());
    let x = y.cross(z);
    Mat3::from_cols(x, y, z)
}

pub(crate) fn mat3_to_quat(m: &Mat3) -> Quat {
    Quat::from_mat3(&normalize_mat3(m)).normalize()
}

/// Handle length factor for a cubic Bezier approximating a circular arc between two
/// unit tangents. Straight tangents give `0.25` (a third of the span after dividing
/// by the 0.75 circle constant), opposite tangents give `0.5`.
pub fn cubic_tangent_factor_circle(tan_l: Vec3, tan_r: Vec3) -> f32 {
    const EPS: f32 = 1.0e-7;

    let tan_dot = tan_l.dot(tan_r);
    if tan_dot > 1.0 - EPS {
        (1.0 / 3.0) * 0.75
    } else if tan_dot < -1.0 + EPS {
        0.5
    } else {
        let angle = tan_dot.acos() / 2.0;
        let angle_sin = angle.sin();
        let angle_cos = angle.cos();
        ((1.0 - angle_cos) / (angle_sin * 2.0)) / angle_sin
    }
}

/// Evaluates one coordinate of a cubic Bezier at `it + 1` evenly spaced parameters using
/// forward differences, writing `out[i][component]`.
pub(crate) fn forward_diff_bezier(
    q: [f32; 4],
    it: usize,
    out: &mut [[f32; 4]],
    component: usize,
) {
    let [q0, q1, q2, q3] = q;
    let mut f = it as f32;
    let rt0 = q0;
    let rt1 = 3.0 * (q1 - q0) / f;
    f *= f;
    let rt2 = 3.0 * (q0 - 2.0 * q1 + q2) / f;
    f *= it as f32;
    let rt3 = (q3 - q0 + 3.0 * (q1 - q2)) / f;

    let mut p0 = rt0;
    let mut p1 = rt1 + rt2 + rt3;
    let mut p2 = 2.0 * rt2 + 6.0 * rt3;
    let p3 = 6.0 * rt3;

    for point in out.iter_mut().take(it + 1) {
        point[component] = p0;
        p0 += p1;
        p1 += p2;
        p2 += p3;
    }
}

/// Min/max accumulation used for bounds.
pub(crate) fn minmax(min: &mut Vec3, max: &mut Vec3, point: Vec3) {
    *min = min.min(point);
    *max = max.max(point);
}
