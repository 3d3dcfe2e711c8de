pub mod common;
pub mod convert;

pub use convert::{convert_video, get_job, get_progress, list_resolutions};
