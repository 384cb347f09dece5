pub mod hgrn;

pub use hgrn::{compose_lower_bounds, HgrnBlock, HgrnForCausalLM, HgrnModel};
