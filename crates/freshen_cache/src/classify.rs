//! Path classification: which arguments are filesystem dependencies.
//!
//! Only direct argument values are inspected. A list or object that happens to
//! contain path strings is ordinary data.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::args::{ArgRole, CallArgs};

/// Returns the path named by `value` if it is a trackable dependency.
///
/// A value is trackable when it is a string naming an existing regular file
/// (symlinks are followed). Any other string, and every non-string value, is
/// plain data.
pub fn classify(value: &Value) -> Option<PathBuf> {
    match value {
        Value::String(s) if !s.is_empty() => {
            let path = Path::new(s);
            path.is_file().then(|| path.to_path_buf())
        }
        _ => None,
    }
}

/// Classifies every argument of a call, returning the trackable ones with
/// their roles in [`CallArgs::iter`] order.
pub fn trackable_paths(args: &CallArgs) -> Vec<(ArgRole, PathBuf)> {
    args.iter()
        .filter_map(|(role, value)| classify(value).map(|path| (role, path)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn existing_file_is_trackable() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let value = json!(file.path().to_str().unwrap());
        assert_eq!(classify(&value), Some(file.path().to_path_buf()));
    }

    #[test]
    fn missing_file_is_data() {
        assert_eq!(classify(&json!("/definitely/not/here.txt")), None);
    }

    #[test]
    fn directory_is_data() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(classify(&json!(dir.path().to_str().unwrap())), None);
    }

    #[test]
    fn non_strings_are_data() {
        assert_eq!(classify(&json!(42)), None);
        assert_eq!(classify(&json!(null)), None);
        assert_eq!(classify(&json!("")), None);
    }

    #[test]
    fn containers_are_not_searched() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        assert_eq!(classify(&json!([path])), None);
        assert_eq!(classify(&json!({ "input": path })), None);
    }

    #[test]
    fn trackable_paths_reports_roles() {
        let a = tempfile::NamedTempFile::new().unwrap();
        let b = tempfile::NamedTempFile::new().unwrap();
        let args = CallArgs::new()
            .arg(a.path().to_str().unwrap())
            .arg(7)
            .kwarg("extra", b.path().to_str().unwrap())
            .kwarg("label", "not a file");

        let deps = trackable_paths(&args);
        assert_eq!(
            deps,
            vec![
                (ArgRole::Positional(0), a.path().to_path_buf()),
                (ArgRole::Keyword("extra".to_string()), b.path().to_path_buf()),
            ]
        );
    }
}
