pub mod hash;
pub mod uri_serde;

use std::path::Path;

pub fn file_read_sync(path: impl AsRef<Path>) -> std::io::Result<Vec<u8>> {
    std::fs::read(path)
}
