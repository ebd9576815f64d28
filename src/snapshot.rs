use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Output paths for one captured frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotPaths {
    pub jpeg: PathBuf,
    pub bitmap: PathBuf,
}

/// Names snapshots `<epoch-ms>.jpg` / `<epoch-ms>.bmp` inside the output folder.
///
/// Frames landing on the same millisecond as the previous one get a `-<n>`
/// suffix instead of overwriting it. Names never go backwards: if the wall
/// clock steps back, frames keep the newest millisecond seen and count up
/// its suffix.
pub struct SnapshotNamer {
    folder: PathBuf,
    last_ms: Option<u64>,
    repeat: u32,
}

impl SnapshotNamer {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            last_ms: None,
            repeat: 0,
        }
    }

    pub fn next(&mut self, now_ms: u64) -> SnapshotPaths {
        let now_ms = self.last_ms.map_or(now_ms, |last| last.max(now_ms));
        if self.last_ms == Some(now_ms) {
            self.repeat += 1;
        } else {
            self.last_ms = Some(now_ms);
            self.repeat = 0;
        }

        let stem = if self.repeat == 0 {
            now_ms.to_string()
        } else {
            format!("{now_ms}-{}", self.repeat)
        };

        SnapshotPaths {
            jpeg: self.folder.join(format!("{stem}.jpg")),
            bitmap: self.folder.join(format!("{stem}.bmp")),
        }
    }
}

/// Write `parts` back to back into `path`, replacing it atomically.
///
/// The bytes go to a temporary file in the same directory which is renamed
/// over `path` once everything is written; on error the temporary is removed.
pub fn persist(path: &Path, parts: &[&[u8]]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut builder = tempfile::Builder::new();
    builder.prefix(".stream2img-").suffix(".part");
    // the mode goes to open(2), so the umask still applies as for File::create
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }

    let mut tmp = builder.tempfile_in(dir)?;
    for part in parts {
        tmp.write_all(part)?;
    }
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn names_by_timestamp() {
        let mut namer = SnapshotNamer::new("cam");
        let paths = namer.next(1_700_000_000_123);
        assert_eq!(paths.jpeg, Path::new("cam/1700000000123.jpg"));
        assert_eq!(paths.bitmap, Path::new("cam/1700000000123.bmp"));
    }

    #[test]
    fn same_millisecond_gets_suffix() {
        let mut namer = SnapshotNamer::new("out");
        let a = namer.next(42);
        let b = namer.next(42);
        let c = namer.next(42);
        let d = namer.next(43);

        assert_eq!(a.bitmap, Path::new("out/42.bmp"));
        assert_eq!(b.bitmap, Path::new("out/42-1.bmp"));
        assert_eq!(c.jpeg, Path::new("out/42-2.jpg"));
        assert_eq!(d.jpeg, Path::new("out/43.jpg"));
    }

    #[test]
    fn persist_concatenates_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");

        persist(&path, &[&b"abc"[..], &b""[..], &b"de"[..]]).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abcde");

        persist(&path, &[&b"x"[..]]).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"x");

        // only the final file, no leftover temporaries
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn clock_stepping_back_never_reuses_a_name() {
        let mut namer = SnapshotNamer::new("out");
        let a = namer.next(100);
        let b = namer.next(101);
        let c = namer.next(100);
        let d = namer.next(99);
        let e = namer.next(102);

        assert_eq!(a.bitmap, Path::new("out/100.bmp"));
        assert_eq!(b.bitmap, Path::new("out/101.bmp"));
        assert_eq!(c.bitmap, Path::new("out/101-1.bmp"));
        assert_eq!(d.jpeg, Path::new("out/101-2.jpg"));
        assert_eq!(e.jpeg, Path::new("out/102.jpg"));
    }

    #[cfg(unix)]
    #[test]
    fn persisted_file_mode_matches_file_create() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.bin");
        fs::File::create(&plain).unwrap();
        let snapshot = dir.path().join("snapshot.bin");
        persist(&snapshot, &[&b"abc"[..]]).unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&snapshot), mode(&plain));
    }

    #[test]
    fn persist_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("blob.bin");
        assert!(persist(&path, &[&b"abc"[..]]).is_err());
        assert!(!path.exists());
    }
}
