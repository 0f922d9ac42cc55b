use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use crate::commons::error::IoError;

/// Reads a file as UTF-8 text.
pub fn read_to_string(path: &Path) -> Result<String, IoError> {
    let mut f = File::open(path).map_err(|e| IoError::new(format!("Could not open: '{}'", path.display()), e))?;
    let mut text = String::new();
    f.read_to_string(&mut text)
        .map_err(|e| IoError::new(format!("Could not read: '{}'", path.display()), e))?;
    Ok(text)
}

/// Returns the first of the given base directories under which `rel`
/// names an existing file. An empty base stands for `rel` itself.
pub fn resolve_in(rel: &Path, bases: &[PathBuf]) -> Option<PathBuf> {
    bases.iter().map(|base| base.join(rel)).find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn resolve_first_existing_candidate() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(second.path().join("pin.txt"), b"1234").unwrap();

        let found = resolve_in(
            Path::new("pin.txt"),
            &[first.path().to_path_buf(), second.path().to_path_buf()],
        );
        assert_eq!(found, Some(second.path().join("pin.txt")));

        assert_eq!(resolve_in(Path::new("missing.txt"), &[first.path().to_path_buf()]), None);
    }

    #[test]
    fn read_reports_path_on_error() {
        let err = read_to_string(Path::new("/definitely/not/here")).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here"));
    }
}
