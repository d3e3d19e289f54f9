// src/sources.rs
// Which directories of the media tree get backed up, and in what order.

use crate::config::Config;
use std::path::{Path, PathBuf};

/// Subdirectories of the Immich tree that are worth backing up, in
/// priority order. The originals in `library` matter most; generated
/// content is reproducible and ranks last.
const SOURCE_SUBDIRS: [&str; 4] = ["library", "upload", "profile", "backups"];

pub const DEFAULT_PRIORITY: i64 = 99;

/// Infer a job priority from a source path. Matching is on path
/// components, case-insensitive; the first recognised component wins.
pub fn priority_for_path(path: &Path) -> i64 {
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy().to_lowercase();
        match name.as_str() {
            "library" => return 1,
            "upload" => return 2,
            "profile" => return 3,
            "backups" => return 4,
            "data" => return 5,
            _ => {}
        }
    }
    DEFAULT_PRIORITY
}

/// Enumerate the source paths for one run: the known subdirectories that
/// exist under the data tree, plus the local data directory (which holds
/// the store itself). Each becomes one job.
pub fn enumerate_sources(config: &Config) -> Vec<(PathBuf, i64)> {
    let mut sources = Vec::new();

    for name in SOURCE_SUBDIRS {
        let path = config.immich_path.join(name);
        if path.is_dir() {
            let priority = priority_for_path(&path);
            sources.push((path, priority));
        }
    }

    if config.data_dir.is_dir() {
        let priority = priority_for_path(&config.data_dir);
        sources.push((config.data_dir.clone(), priority));
    }

    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_MAX_RETRIES, DEFAULT_STATS_INTERVAL_SECS};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_priority_inference() {
        assert_eq!(priority_for_path(Path::new("/x/library/y")), 1);
        assert_eq!(priority_for_path(Path::new("/upload")), 2);
        assert_eq!(priority_for_path(Path::new("/PROFILE")), 3);
        assert_eq!(priority_for_path(Path::new("/foo/backups")), 4);
        assert_eq!(priority_for_path(Path::new("/u/dam/data")), 5);
        assert_eq!(priority_for_path(Path::new("/misc")), DEFAULT_PRIORITY);
    }

    #[test]
    fn test_enumerate_only_existing_subdirs() {
        let tmp = TempDir::new().unwrap();
        let tree = tmp.path().join("immich");
        for name in ["library", "upload"] {
            fs::create_dir_all(tree.join(name)).unwrap();
        }
        // "profile" é um arquivo, não um diretório: deve ser ignorado
        fs::write(tree.join("profile"), b"not a dir").unwrap();

        let data_dir = tmp.path().join("data");
        fs::create_dir_all(&data_dir).unwrap();

        let config = Config {
            immich_path: tree.clone(),
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            data_dir: data_dir.clone(),
        };

        let sources = enumerate_sources(&config);
        let expected = vec![
            (tree.join("library"), 1),
            (tree.join("upload"), 2),
            (data_dir, 5),
        ];
        assert_eq!(sources, expected);
    }
}
