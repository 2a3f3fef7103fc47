//! Per-socket tasks: frame reader, frame writer, and periodic timers.

pub(crate) mod interval;
pub(crate) mod read;
pub(crate) mod write;
