//! Static file serving.

mod static_files;

pub use static_files::StaticFiles;
