//! Rotation representations used by pose channels.
//!
//! Euler angles follow the "extrinsic in listed order" convention: `Xyz` rotates about X
//! first, then Y, then Z, all around fixed axes (`Rz * Ry * Rx`).

use glam::{Mat3, Quat, Vec3};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EulerOrder {
    #[default]
    Xyz,
    Xzy,
    Yxz,
    Yzx,
    Zxy,
    Zyx,
}

impl EulerOrder {
    pub const ALL: [EulerOrder; 6] = [
        Self::Xyz,
        Self::Xzy,
        Self::Yxz,
        Self::Yzx,
        Self::Zxy,
        Self::Zyx,
    ];

    /// Axis permutation `(i, j, k)` and parity (odd orders negate the angles).
    fn axes(self) -> ([usize; 3], bool) {
        match self {
            Self::Xyz => ([0, 1, 2], false),
            Self::Xzy => ([0, 2, 1], true),
            Self::Yxz => ([1, 0, 2], true),
            Self::Yzx => ([1, 2, 0], false),
            Self::Zxy => ([2, 0, 1], false),
            Self::Zyx => ([2, 1, 0], true),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RotationMode {
    #[default]
    Quaternion,
    AxisAngle,
    Euler(EulerOrder),
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Rotation {
    /// Normalized before use, the stored value is kept as animated.
    Quaternion(Quat),
    AxisAngle { axis: Vec3, angle: f32 },
    Euler { angles: Vec3, order: EulerOrder },
}

impl Default for Rotation {
    fn default() -> Self {
        Self::Quaternion(Quat::IDENTITY)
    }
}

impl Rotation {
    /// Identity rotation stored in the given representation.
    pub fn identity(mode: RotationMode) -> Self {
        match mode {
            RotationMode::Quaternion => Self::Quaternion(Quat::IDENTITY),
            RotationMode::AxisAngle => Self::AxisAngle {
                axis: Vec3::Y,
                angle: 0.0,
            },
            RotationMode::Euler(order) => Self::Euler {
                angles: Vec3::ZERO,
                order,
            },
        }
    }

    pub fn mode(&self) -> RotationMode {
        match self {
            Self::Quaternion(_) => RotationMode::Quaternion,
            Self::AxisAngle { .. } => RotationMode::AxisAngle,
            Self::Euler { order, .. } => RotationMode::Euler(*order),
        }
    }

    pub fn to_mat3(&self) -> Mat3 {
        match *self {
            Self::Quaternion(q) => Mat3::from_quat(normalize_quat_or_identity(q)),
            Self::AxisAngle { axis, angle } => match axis.try_normalize() {
                Some(axis) => Mat3::from_axis_angle(axis, angle),
                None => Mat3::IDENTITY,
            },
            Self::Euler { angles, order } => euler_to_mat3(angles, order),
        }
    }

    pub fn to_quat(&self) -> Quat {
        match *self {
            Self::Quaternion(q) => normalize_quat_or_identity(q),
            Self::AxisAngle { axis, angle } => match axis.try_normalize() {
                Some(axis) => Quat::from_axis_angle(axis, angle),
                None => Quat::IDENTITY,
            },
            Self::Euler { angles, order } => {
                normalize_quat_or_identity(Quat::from_mat3(&euler_to_mat3(angles, order)))
            }
        }
    }

    /// Rotation from a pure rotation matrix, stored in `mode`.
    pub fn from_mat3(m: &Mat3, mode: RotationMode) -> Self {
        match mode {
            RotationMode::Quaternion => {
                Self::Quaternion(normalize_quat_or_identity(Quat::from_mat3(m)))
            }
            RotationMode::AxisAngle => {
                let (axis, angle) = normalize_quat_or_identity(Quat::from_mat3(m)).to_axis_angle();
                axis_angle_with_fallback(axis, angle)
            }
            RotationMode::Euler(order) => Self::Euler {
                angles: mat3_to_euler(m, order),
                order,
            },
        }
    }

    /// Same orientation expressed in another representation. Switching between two Euler
    /// orders keeps the raw angles, matching how animators expect a mode switch to behave.
    pub fn converted(&self, mode: RotationMode) -> Self {
        match (*self, mode) {
            (Self::Euler { angles, .. }, RotationMode::Euler(order)) => {
                Self::Euler { angles, order }
            }
            (_, RotationMode::Euler(order)) => Self::Euler {
                angles: mat3_to_euler(&self.to_mat3(), order),
                order,
            },
            (_, RotationMode::Quaternion) => Self::Quaternion(self.to_quat()),
            (Self::AxisAngle { axis, angle }, RotationMode::AxisAngle) => {
                axis_angle_with_fallback(axis, angle)
            }
            (_, RotationMode::AxisAngle) => {
                let (axis, angle) = self.to_quat().to_axis_angle();
                axis_angle_with_fallback(axis, angle)
            }
        }
    }
}

/// An axis with all components equal (including zero) carries no direction; use +Y so the
/// rotation turns into a roll.
fn axis_angle_with_fallback(axis: Vec3, angle: f32) -> Rotation {
    let mut axis = axis;
    if (axis.x - axis.y).abs() <= f32::EPSILON && (axis.y - axis.z).abs() <= f32::EPSILON {
        axis.y = 1.0;
    }
    Rotation::AxisAngle { axis, angle }
}

pub(crate) fn normalize_quat_or_identity(q: Quat) -> Quat {
    let len = q.length();
    if len > f32::MIN_POSITIVE && len.is_finite() {
        q / len
    } else {
        Quat::IDENTITY
    }
}

#[inline]
fn set(m: &mut Mat3, col: usize, row: usize, value: f32) {
    m.col_mut(col)[row] = value;
}

#[inline]
fn get(m: &Mat3, col: usize, row: usize) -> f32 {
    m.col(col)[row]
}

pub fn euler_to_mat3(angles: Vec3, order: EulerOrder) -> Mat3 {
    let ([i, j, k], parity) = order.axes();
    let e = angles.to_array();
    let (ti, tj, th) = if parity {
        (-e[i], -e[j], -e[k])
    } else {
        (e[i], e[j], e[k])
    };

    let (si, ci) = ti.sin_cos();
    let (sj, cj) = tj.sin_cos();
    let (sh, ch) = th.sin_cos();
    let cc = ci * ch;
    let cs = ci * sh;
    let sc = si * ch;
    let ss = si * sh;

    let mut m = Mat3::IDENTITY;
    set(&mut m, i, i, cj * ch);
    set(&mut m, j, i, sj * sc - cs);
    set(&mut m, k, i, sj * cc + ss);
    set(&mut m, i, j, cj * sh);
    set(&mut m, j, j, sj * ss + cc);
    set(&mut m, k, j, sj * cs - sc);
    set(&mut m, i, k, -sj);
    set(&mut m, j, k, cj * si);
    set(&mut m, k, k, cj * ci);
    m
}

/// Euler angles of a rotation matrix. Of the two equivalent solutions the one with the
/// smallest total magnitude is returned.
pub fn mat3_to_euler(m: &Mat3, order: EulerOrder) -> Vec3 {
    let m = crate::geometry::normalize_mat3(m);
    let ([i, j, k], parity) = order.axes();

    let mut eul1 = [0.0f32; 3];
    let mut eul2 = [0.0f32; 3];
    let cy = get(&m, i, i).hypot(get(&m, i, j));

    if cy > 16.0 * f32::EPSILON {
        eul1[i] = get(&m, j, k).atan2(get(&m, k, k));
        eul1[j] = (-get(&m, i, k)).atan2(cy);
        eul1[k] = get(&m, i, j).atan2(get(&m, i, i));

        eul2[i] = (-get(&m, j, k)).atan2(-get(&m, k, k));
        eul2[j] = (-get(&m, i, k)).atan2(-cy);
        eul2[k] = (-get(&m, i, j)).atan2(-get(&m, i, i));
    } else {
        eul1[i] = (-get(&m, k, j)).atan2(get(&m, j, j));
        eul1[j] = (-get(&m, i, k)).atan2(cy);
        eul1[k] = 0.0;
        eul2 = eul1;
    }

    let mut eul1 = Vec3::from_array(eul1);
    let mut eul2 = Vec3::from_array(eul2);
    if parity {
        eul1 = -eul1;
        eul2 = -eul2;
    }

    if eul1.abs().element_sum() > eul2.abs().element_sum() {
        eul2
    } else {
        eul1
    }
}
