//! dutlab-cutters - cutter registry
//!
//! This crate handles opening cutter backends by family name and building
//! the process-wide [`CutterSet`]: every recognized relay unit from every
//! configured family, with `(cutter id, channel id)` lookups producing
//! [`PowerChannel`] handles. Vendor tooling never leaks past this point.

mod registry;

pub use registry::{available_families, open_family, Cutter, CutterSet, FamilyInfo};
