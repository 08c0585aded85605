#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod accel;
pub mod linalg;
pub mod matrix;
pub mod stats;
pub mod types;

#[path = "../regress/mod.rs"]
pub mod regress;

// Federation layer: aggregation primitives, site artifacts and reporting.
#[path = "../federate/mod.rs"]
pub mod federate;
