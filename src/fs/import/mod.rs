pub mod dir;
pub mod tar;

pub use dir::import_path;
pub use tar::{import_tar, import_tar_auto};
