use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Rolling raw dump of the unescaped byte stream, for replay and offline
/// analysis. When the size limit is reached the file moves to `.old` and a
/// fresh one is started.
#[derive(Debug)]
pub struct Dump {
    path: PathBuf,
    limit: u64,
    file: Option<File>,
    written: u64,
}

impl Dump {
    pub fn new(path: impl Into<PathBuf>, limit: u64) -> Dump {
        Dump {
            path: path.into(),
            limit,
            file: None,
            written: 0,
        }
    }

    fn open(&mut self) -> std::io::Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.written = file.metadata()?.len();
            self.file = Some(file);
        }
        Ok(())
    }

    /// Appends one received symbol, rolling over at the size limit.
    pub fn write(&mut self, byte: u8) -> std::io::Result<()> {
        self.open()?;
        if self.written >= self.limit {
            self.file = None;
            let mut old = self.path.clone().into_os_string();
            old.push(".old");
            std::fs::rename(&self.path, PathBuf::from(old))?;
            self.open()?;
        }
        if let Some(file) = &mut self.file {
            file.write_all(&[byte])?;
            self.written += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolls_over_at_limit() {
        let dir = std::env::temp_dir().join("ebus-master-dump-test");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dump.bin");
        let mut dump = Dump::new(&path, 4);
        for byte in 0..6u8 {
            dump.write(byte).unwrap();
        }
        let old = std::fs::read(dir.join("dump.bin.old")).unwrap();
        assert_eq!(old, vec![0, 1, 2, 3]);
        let fresh = std::fs::read(&path).unwrap();
        assert_eq!(fresh, vec![4, 5]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
