#[cfg(feature = "kiln-base")]
pub use kiln_base as base;

#[cfg(feature = "kiln-pipeline")]
pub use kiln_pipeline as pipeline;
