//! Custom Resource Definitions (CRDs) for pd-operator.
//!
//! - `PdCluster`: desired PD placement tier and its observed status

mod pd_cluster;

pub use pd_cluster::*;
