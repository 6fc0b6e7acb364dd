mod admin;
mod files;
mod sync;

pub use admin::{admin_purge, health};
pub use files::{delete_file, get_file, get_file_content, list_files, upload_file, FileResponse};
pub use sync::{request_resync, run_sync, sync_status};
