use std::ffi::OsString;
use std::fs::{DirBuilder, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::subnet::Subnet;

const HEADER: [&str; 2] = ["Name", "Subnet"];

/// A name bound to a subnet in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub name: String,
    pub subnet: Subnet,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Record {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Subnet")]
    subnet: String,
}

/// Name -> subnet allocations kept in a `Name,Subnet` CSV file.
///
/// Nothing is cached: every call re-reads the file, and every mutation
/// rewrites it through a temp file and a rename. There is no locking, so
/// the file must only be driven by one process at a time.
#[derive(Debug, Clone)]
pub struct CsvSubnetRegistry {
    path: PathBuf,
}

impl CsvSubnetRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All allocations in file order. A missing file is an empty registry.
    pub fn list_all(&self) -> Result<Vec<Allocation>, StorageError> {
        self.read_records()?
            .into_iter()
            .map(|(line, r)| self.to_allocation(line, r))
            .collect()
    }

    /// Adds one record at the end. No duplicate or overlap checks here.
    pub fn append(&self, name: &str, subnet: Subnet) -> Result<(), StorageError> {
        let mut records = self
            .read_records()?
            .into_iter()
            .map(|(_, r)| r)
            .collect::<Vec<_>>();
        records.push(Record {
            name: name.to_string(),
            subnet: subnet.to_string(),
        });
        self.write_records(&records)
    }

    /// Subnet of the first record named exactly `name`.
    pub fn find_by_name(&self, name: &str) -> Result<Option<Subnet>, StorageError> {
        let found = self
            .read_records()?
            .into_iter()
            .find(|(_, r)| r.name == name);
        match found {
            Some((line, r)) => Ok(Some(self.to_allocation(line, r)?.subnet)),
            None => Ok(None),
        }
    }

    /// Drops every record named exactly `name`.
    pub fn remove_by_name(&self, name: &str) -> Result<(), StorageError> {
        if !self.exists()? {
            return Ok(());
        }
        let records = self
            .read_records()?
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.name != name)
            .collect::<Vec<_>>();
        self.write_records(&records)
    }

    fn exists(&self) -> Result<bool, StorageError> {
        self.path.try_exists().map_err(|e| self.io_err(e))
    }

    fn read_records(&self) -> Result<Vec<(u64, Record)>, StorageError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(self.io_err(e)),
        };
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(file);
        let headers = reader.headers().map_err(|e| self.csv_err(e))?.clone();

        let mut records = vec![];
        let mut raw = csv::StringRecord::new();
        while reader.read_record(&mut raw).map_err(|e| self.csv_err(e))? {
            let line = raw.position().map(|it| it.line()).unwrap_or_default();
            let record: Record = raw
                .deserialize(Some(&headers))
                .map_err(|e| self.csv_err(e))?;
            records.push((line, record));
        }
        Ok(records)
    }

    fn to_allocation(&self, line: u64, r: Record) -> Result<Allocation, StorageError> {
        let subnet = r
            .subnet
            .parse::<Subnet>()
            .map_err(|e| StorageError::CorruptRecord {
                path: self.path.clone(),
                line,
                reason: e.to_string(),
            })?;
        Ok(Allocation {
            name: r.name,
            subnet,
        })
    }

    // write to a dot file beside the registry, then rename over it
    fn write_records(&self, records: &[Record]) -> Result<(), StorageError> {
        let file_name = self.path.file_name().ok_or_else(|| {
            self.io_err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "registry path has no file name",
            ))
        })?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        DirBuilder::new()
            .recursive(true)
            .create(&dir)
            .map_err(|e| self.io_err(e))?;

        let mut tmp_name = OsString::from(".");
        tmp_name.push(file_name);
        tmp_name.push(".tmp");
        let tmp_path = dir.join(tmp_name);

        if let Err(e) = self
            .write_tmp(&tmp_path, records)
            .and_then(|_| self.keep_permissions(&tmp_path))
        {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(self.io_err(e));
        }
        Ok(())
    }

    fn write_tmp(&self, tmp_path: &Path, records: &[Record]) -> Result<(), StorageError> {
        let tmp_file = File::create(tmp_path).map_err(|e| self.io_err(e))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(tmp_file);
        writer.write_record(HEADER).map_err(|e| self.csv_err(e))?;
        for r in records {
            writer.serialize(r).map_err(|e| self.csv_err(e))?;
        }
        let mut tmp_file = writer
            .into_inner()
            .map_err(|e| self.io_err(e.into_error()))?;
        tmp_file.flush().map_err(|e| self.io_err(e))?;
        tmp_file.sync_all().map_err(|e| self.io_err(e))?;
        Ok(())
    }

    // the rename must not reset the mode of an existing registry
    fn keep_permissions(&self, tmp_path: &Path) -> Result<(), StorageError> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => {
                std::fs::set_permissions(tmp_path, meta.permissions()).map_err(|e| self.io_err(e))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn io_err(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn csv_err(&self, source: csv::Error) -> StorageError {
        StorageError::Csv {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sn(s: &str) -> Subnet {
        s.parse().unwrap()
    }

    fn registry() -> (tempfile::TempDir, CsvSubnetRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = CsvSubnetRegistry::new(dir.path().join("subnets.csv"));
        (dir, registry)
    }

    fn names(registry: &CsvSubnetRegistry) -> Vec<String> {
        registry
            .list_all()
            .unwrap()
            .into_iter()
            .map(|it| it.name)
            .collect()
    }

    #[test]
    fn test_missing_store_is_empty() {
        let (_dir, registry) = registry();
        assert!(registry.list_all().unwrap().is_empty());
        assert_eq!(registry.find_by_name("openvpn_tunnel_subnet").unwrap(), None);
        registry.remove_by_name("ghost").unwrap();
        assert!(!registry.path().exists());
    }

    #[test]
    fn test_append_writes_header() {
        let (_dir, registry) = registry();
        registry.append("openvpn_tunnel_subnet", sn("10.8.0.0/24")).unwrap();
        registry.append("siteA", sn("10.255.254.0/24")).unwrap();
        let content = std::fs::read_to_string(registry.path()).unwrap();
        assert_eq!(
            content,
            "Name,Subnet\nopenvpn_tunnel_subnet,10.8.0.0/24\nsiteA,10.255.254.0/24\n"
        );
    }

    #[test]
    fn test_round_trip() {
        let (_dir, registry) = registry();
        for (name, input) in [("a", "10.8.0.5/24"), ("b", "192.168.1.0 255.255.255.0")] {
            let subnet = sn(input);
            registry.append(name, subnet).unwrap();
            assert_eq!(registry.find_by_name(name).unwrap(), Some(subnet));
        }
        assert_eq!(names(&registry), vec!["a", "b"]);
    }

    #[test]
    fn test_append_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CsvSubnetRegistry::new(dir.path().join("pki").join("subnets.csv"));
        registry.append("x", sn("10.0.0.0/8")).unwrap();
        assert_eq!(registry.find_by_name("x").unwrap(), Some(sn("10.0.0.0/8")));
    }

    #[test]
    fn test_append_keeps_duplicates() {
        let (_dir, registry) = registry();
        registry.append("dup", sn("10.1.0.0/24")).unwrap();
        registry.append("dup", sn("10.2.0.0/24")).unwrap();
        assert_eq!(names(&registry), vec!["dup", "dup"]);
        assert_eq!(registry.find_by_name("dup").unwrap(), Some(sn("10.1.0.0/24")));
    }

    #[test]
    fn test_remove_by_name() {
        let (_dir, registry) = registry();
        registry.append("keep1", sn("10.1.0.0/24")).unwrap();
        registry.append("gone", sn("10.2.0.0/24")).unwrap();
        registry.append("keep2", sn("10.3.0.0/24")).unwrap();
        registry.append("gone", sn("10.4.0.0/24")).unwrap();

        registry.remove_by_name("gone").unwrap();
        assert_eq!(registry.find_by_name("gone").unwrap(), None);
        assert_eq!(
            registry.list_all().unwrap(),
            vec![
                Allocation {
                    name: "keep1".into(),
                    subnet: sn("10.1.0.0/24")
                },
                Allocation {
                    name: "keep2".into(),
                    subnet: sn("10.3.0.0/24")
                },
            ]
        );

        // no temp file left behind
        let entries = std::fs::read_dir(registry.path().parent().unwrap())
            .unwrap()
            .count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_failed_rewrite_keeps_old_content() {
        let (dir, registry) = registry();
        registry.append("a", sn("10.1.0.0/24")).unwrap();
        let before = std::fs::read(registry.path()).unwrap();

        // a directory where the temp file should go makes every rewrite fail
        std::fs::create_dir(dir.path().join(".subnets.csv.tmp")).unwrap();

        let err = registry.append("b", sn("10.2.0.0/24")).unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }), "{:?}", err);
        assert_eq!(std::fs::read(registry.path()).unwrap(), before);

        let err = registry.remove_by_name("a").unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }), "{:?}", err);
        assert_eq!(std::fs::read(registry.path()).unwrap(), before);
        assert_eq!(names(&registry), vec!["a"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_rewrite_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, registry) = registry();
        registry.append("a", sn("10.1.0.0/24")).unwrap();
        std::fs::set_permissions(registry.path(), std::fs::Permissions::from_mode(0o600))
            .unwrap();

        registry.append("b", sn("10.2.0.0/24")).unwrap();
        let mode = std::fs::metadata(registry.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        registry.remove_by_name("a").unwrap();
        let mode = std::fs::metadata(registry.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_remove_no_match_is_noop() {
        let (_dir, registry) = registry();
        registry.append("a", sn("10.1.0.0/24")).unwrap();
        let before = std::fs::read_to_string(registry.path()).unwrap();
        registry.remove_by_name("b").unwrap();
        let after = std::fs::read_to_string(registry.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_remove_last_keeps_header() {
        let (_dir, registry) = registry();
        registry.append("a", sn("10.1.0.0/24")).unwrap();
        registry.remove_by_name("a").unwrap();
        assert_eq!(std::fs::read_to_string(registry.path()).unwrap(), "Name,Subnet\n");
        assert!(registry.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_reads_hand_edited_store() {
        let (_dir, registry) = registry();
        std::fs::write(
            registry.path(),
            "Name,Subnet\r\n\"site, east\", 10.9.0.0/16\r\nlegacy,10.7.0.9/24\r\n",
        )
        .unwrap();
        let all = registry.list_all().unwrap();
        assert_eq!(all[0].name, "site, east");
        assert_eq!(all[0].subnet, sn("10.9.0.0/16"));
        assert_eq!(all[1].subnet, sn("10.7.0.0/24"));
    }

    #[test]
    fn test_empty_file() {
        let (_dir, registry) = registry();
        std::fs::write(registry.path(), "").unwrap();
        assert!(registry.list_all().unwrap().is_empty());
        registry.append("a", sn("10.1.0.0/24")).unwrap();
        assert_eq!(names(&registry), vec!["a"]);
    }

    #[test]
    fn test_corrupt_record() {
        let (_dir, registry) = registry();
        std::fs::write(registry.path(), "Name,Subnet\na,10.1.0.0/24\nb,not-a-subnet\n").unwrap();
        match registry.list_all() {
            Err(StorageError::CorruptRecord { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected corrupt record, got {:?}", other),
        }
        // lookups that stop before the bad row still work
        assert_eq!(registry.find_by_name("a").unwrap(), Some(sn("10.1.0.0/24")));
    }

    #[test]
    fn test_wrong_header() {
        let (_dir, registry) = registry();
        std::fs::write(registry.path(), "Client,Net\na,10.1.0.0/24\n").unwrap();
        assert!(matches!(registry.list_all(), Err(StorageError::Csv { .. })));
    }
}
