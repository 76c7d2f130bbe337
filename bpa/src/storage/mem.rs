use super::{RecoveredBundle, Result, Storage};
use bytes::Bytes;
use std::{collections::HashMap, sync::Mutex};

/// In-process storage backend.
///
/// Holds bundle images in a map; contents do not survive a restart, so
/// `recover` only ever reports what the current process stored. The
/// default backend for nodes without persistent media.
#[derive(Default)]
pub struct MemStorage {
    bundles: Mutex<HashMap<u32, Bytes>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn save(&self, bundle_number: u32, data: Bytes) -> Result<()> {
        self.bundles
            .lock()
            .expect("storage poisoned")
            .insert(bundle_number, data);
        Ok(())
    }

    fn load(&self, bundle_number: u32) -> Result<Option<Bytes>> {
        Ok(self
            .bundles
            .lock()
            .expect("storage poisoned")
            .get(&bundle_number)
            .cloned())
    }

    fn delete(&self, bundle_number: u32) -> Result<()> {
        self.bundles
            .lock()
            .expect("storage poisoned")
            .remove(&bundle_number);
        Ok(())
    }

    fn recover(&self) -> Result<Vec<RecoveredBundle>> {
        Ok(self
            .bundles
            .lock()
            .expect("storage poisoned")
            .iter()
            .map(|(bundle_number, data)| RecoveredBundle {
                bundle_number: *bundle_number,
                data: data.clone(),
            })
            .collect())
    }

    fn wipe(&self) -> Result<()> {
        self.bundles.lock().expect("storage poisoned").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_delete() {
        let storage = MemStorage::new();
        storage.save(7, Bytes::from_static(b"image")).unwrap();
        assert_eq!(storage.load(7).unwrap().unwrap().as_ref(), b"image");

        storage.delete(7).unwrap();
        assert!(storage.load(7).unwrap().is_none());

        // Deleting again is fine.
        storage.delete(7).unwrap();
    }

    #[test]
    fn recover_lists_everything() {
        let storage = MemStorage::new();
        storage.save(1, Bytes::from_static(b"a")).unwrap();
        storage.save(2, Bytes::from_static(b"b")).unwrap();

        let mut numbers: Vec<u32> = storage
            .recover()
            .unwrap()
            .into_iter()
            .map(|r| r.bundle_number)
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, [1, 2]);
    }
}
