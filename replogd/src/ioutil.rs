use std::{
    fs::{self, File},
    io::{self, Write as _},
    path::Path,
};

/// Replace the content of `path` so that a crash leaves either the old or the new version
pub fn write_file_atomically(path: &Path, content: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

/// Read the whole file, `None` if it does not exist
pub fn read_file_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[test]
fn write_file_atomically_replaces_content() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("state");

    assert_eq!(read_file_if_exists(&path)?, None);
    write_file_atomically(&path, b"one")?;
    write_file_atomically(&path, b"two")?;
    assert_eq!(read_file_if_exists(&path)?.as_deref(), Some(&b"two"[..]));
    assert!(!path.with_extension("tmp").exists());
    Ok(())
}
