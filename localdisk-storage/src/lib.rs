/*!
Filesystem-backed bundle storage.

One file per bundle, named `<bundle_number>.b`, holding the raw bundle
image. Writes go through a temporary file, fsync and rename so a reset
mid-write leaves either the old image or none. Recovery scans the
directory for `.b` files and hands every readable image back to the
store, which re-parses and validates it; anything else in the
directory is skipped and logged.
*/

use bytes::Bytes;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};
use tundra_bpa::storage::{RecoveredBundle, Result, Storage};

const BUNDLE_EXTENSION: &str = "b";

pub struct LocaldiskStorage {
    root: PathBuf,
}

impl LocaldiskStorage {
    /// Opens (and creates) the storage directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Opens the platform's default cache location for this node.
    pub fn open_default() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("net", "tundra", "tundra")
            .ok_or("Failed to resolve local cache directory")?;
        Self::open(dirs.cache_dir())
    }

    fn path_of(&self, bundle_number: u32) -> PathBuf {
        self.root.join(format!("{bundle_number}.{BUNDLE_EXTENSION}"))
    }

    fn bundle_number_of(path: &Path) -> Option<u32> {
        if path.extension()?.to_str()? != BUNDLE_EXTENSION {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }
}

impl Storage for LocaldiskStorage {
    fn save(&self, bundle_number: u32, data: Bytes) -> Result<()> {
        let path = self.path_of(bundle_number);
        let tmp = path.with_extension("tmp");

        let mut file = fs::File::create(&tmp)?;
        if let Err(e) = file.write_all(&data).and_then(|_| file.sync_all()) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        drop(file);

        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!("Wrote bundle {bundle_number} ({} octets)", data.len());
        Ok(())
    }

    fn load(&self, bundle_number: u32) -> Result<Option<Bytes>> {
        match fs::read(self.path_of(bundle_number)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, bundle_number: u32) -> Result<()> {
        match fs::remove_file(self.path_of(bundle_number)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn recover(&self) -> Result<Vec<RecoveredBundle>> {
        let mut recovered = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let Ok(entry) = entry else {
                continue;
            };
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            // Leftover temporaries from an interrupted write.
            if path.extension().is_some_and(|e| e == "tmp") {
                let _ = fs::remove_file(&path);
                continue;
            }

            let Some(bundle_number) = Self::bundle_number_of(&path) else {
                warn!("Skipping foreign file {}", path.display());
                continue;
            };

            match fs::read(&path) {
                Ok(data) => recovered.push(RecoveredBundle {
                    bundle_number,
                    data: Bytes::from(data),
                }),
                Err(e) => {
                    warn!("Skipping unreadable file {}: {e}", path.display());
                }
            }
        }
        Ok(recovered)
    }

    fn wipe(&self) -> Result<()> {
        for entry in fs::read_dir(&self.root)? {
            let Ok(entry) = entry else {
                continue;
            };
            if entry.path().is_file() {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }
}
