use std::io::{Cursor, Read};

use bytes::Bytes;
use parking_lot::Mutex;
use zip::result::ZipError;
use zip::ZipArchive;

use super::{module_key, BundleError, ENTRY_POINT, SCRIPT_EXTENSIONS};

/// One archive entry, as listed by [`Bundle::entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// A bundle opened from its archive bytes.
#[derive(Debug)]
pub struct Bundle {
    archive: Mutex<ZipArchive<Cursor<Bytes>>>,
}

impl Bundle {
    pub fn from_bytes(data: Bytes) -> Result<Self, BundleError> {
        let archive = ZipArchive::new(Cursor::new(data))?;
        Ok(Self {
            archive: Mutex::new(archive),
        })
    }

    /// Source of module `name`, trying each script extension in order.
    /// Returns the archive entry name with the source.
    pub fn read_module(&self, name: &str) -> Result<(String, String), BundleError> {
        let key = module_key(name);
        let mut archive = self.archive.lock();
        for ext in SCRIPT_EXTENSIONS {
            let entry = format!("{key}{ext}");
            let mut file = match archive.by_name(&entry) {
                Ok(file) => file,
                Err(ZipError::FileNotFound) => continue,
                Err(e) => return Err(e.into()),
            };
            if file.is_dir() {
                continue;
            }
            let mut source = String::new();
            file.read_to_string(&mut source)?;
            return Ok((entry, source));
        }
        Err(BundleError::ModuleNotFound(name.to_string()))
    }

    pub fn entry_point(&self) -> Result<(String, String), BundleError> {
        self.read_module(ENTRY_POINT).map_err(|e| match e {
            BundleError::ModuleNotFound(_) => BundleError::MissingMain,
            other => other,
        })
    }

    pub fn entries(&self) -> Result<Vec<BundleEntry>, BundleError> {
        let mut archive = self.archive.lock();
        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive.by_index(i)?;
            entries.push(BundleEntry {
                name: file.name().to_string(),
                size: file.size(),
                is_dir: file.is_dir(),
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    use super::*;

    fn archive(files: &[(&str, &str)]) -> Bytes {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        Bytes::from(zip.finish().unwrap().into_inner())
    }

    #[test]
    fn test_extension_order_prefers_risor() {
        let bundle = Bundle::from_bytes(archive(&[("m.rsr", "b"), ("m.risor", "a")])).unwrap();
        assert_eq!(bundle.read_module("m").unwrap(), ("m.risor".to_string(), "a".to_string()));
    }

    #[test]
    fn test_missing_module_and_main() {
        let bundle = Bundle::from_bytes(archive(&[("lib.risor", "1")])).unwrap();
        assert!(matches!(
            bundle.read_module("nope").unwrap_err(),
            BundleError::ModuleNotFound(n) if n == "nope"
        ));
        assert!(matches!(bundle.entry_point().unwrap_err(), BundleError::MissingMain));
    }

    #[test]
    fn test_entries_listed() {
        let bundle = Bundle::from_bytes(archive(&[("main.risor", "12")])).unwrap();
        let entries = bundle.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "main.risor");
        assert_eq!(entries[0].size, 2);
    }

    #[test]
    fn test_not_a_zip() {
        assert!(matches!(
            Bundle::from_bytes(Bytes::from_static(b"plain text")).unwrap_err(),
            BundleError::Zip(_)
        ));
    }
}
