use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("duplicate bone name: {name}")]
    DuplicateBoneName { name: String },

    #[error("unknown bone: {name}")]
    UnknownBone { name: String },

    #[error("invalid bone index: {index}")]
    InvalidBoneIndex { index: usize },

    #[error("unknown parent bone '{parent}' for bone '{bone}'")]
    UnknownBoneParent { bone: String, parent: String },

    #[error("parenting bone '{bone}' to '{parent}' would create a cycle")]
    ParentCycle { bone: String, parent: String },

    #[error("invalid value: {message}")]
    InvalidValue { message: String },

    #[error("armature '{armature}' needs a pose recalc before it can deform geometry")]
    PoseNeedsRecalc { armature: String },

    #[error("armature '{armature}' has no deform cache (usually a dependency cycle)")]
    MissingDeformCache { armature: String },

    #[error("deform cache of armature '{armature}' has {cached} channels, pose has {channels}")]
    StaleDeformCache {
        armature: String,
        cached: usize,
        channels: usize,
    },

    #[error("{buffer} buffer for target '{target}' has {actual} entries, expected {expected}")]
    BufferLength {
        target: String,
        buffer: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("failed to sync proxy armature: '{object}' is missing pose channels {channels:?}")]
    ProxyMissingChannels {
        object: String,
        channels: Vec<String>,
    },
}
