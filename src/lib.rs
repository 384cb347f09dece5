//! Workspace facade crate. All functionality lives in `hgrn-core`.

pub use hgrn_core::{cache, config, layers, models, ops};
