//! Resource generation module.
//!
//! Contains builders for the Kubernetes objects owned by a PdCluster.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | StatefulSet | PD members with stable identity and data volumes |
//! | Client Service | PD API access (`<cluster>-pd`) |
//! | Peer Service | Headless member discovery (`<cluster>-pd-peer`) |
//! | ConfigMap | pd.toml and the startup script |

pub mod common;
pub mod configmap;
pub mod services;
pub mod statefulset;
pub mod version;

// Re-export commonly used items from common
pub use common::{owner_reference, standard_labels};
