mod admin;
mod files;

pub use admin::{collect_garbage, health};
pub use files::{delete_file, download_file, list_files, upload_file};
