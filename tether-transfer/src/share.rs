//! Temp-share and off-catalog share lists.
//!
//! Both are flat lists of complete local files offered to friends, each
//! acting as a file method for the demultiplexer's search. They persist
//! as small XML documents (`temp_shares.xml` / `off_shares.xml`) whose
//! items carry path, hash, size, modification time, method flag and the
//! lent marker.

use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event as XmlEvent};
use quick_xml::{Reader, Writer};
use tracing::{debug, warn};

use tether_core::{Error, FileHash, Result};

use crate::demux::{search_flags, FileMethod};

/// One shared file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareItem {
    pub path: PathBuf,
    pub hash: FileHash,
    pub size: u64,
    /// Seconds since the epoch of the file's last modification when it
    /// was shared; a changed file needs re-hashing before serving.
    pub modified: u64,
    /// [`search_flags`] bit this item answers for.
    pub method: u32,
    /// Borrow key when the item is currently lent out. The file is gone
    /// from disk while set; metadata survives so the return can restore
    /// it.
    pub lent: Option<String>,
}

/// A persistent list of shared files backed by one XML document.
pub struct ShareList {
    file_path: PathBuf,
    method_flag: u32,
    items: Mutex<Vec<ShareItem>>,
}

impl ShareList {
    /// Load the list from `file_path`, starting empty when the file does
    /// not exist yet.
    pub fn load(file_path: impl Into<PathBuf>, method_flag: u32) -> Self {
        let file_path = file_path.into();
        let items = match std::fs::read_to_string(&file_path) {
            Ok(text) => match parse_share_xml(&text) {
                Ok(items) => items,
                Err(e) => {
                    warn!("unreadable share list {}: {e}", file_path.display());
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            file_path,
            method_flag,
            items: Mutex::new(items),
        }
    }

    /// The flag new items of this list carry.
    pub fn method_flag(&self) -> u32 {
        self.method_flag
    }

    pub fn items(&self) -> Vec<ShareItem> {
        self.items.lock().clone()
    }

    /// Share a file. Replaces any item with the same hash.
    pub fn add(&self, path: PathBuf, hash: FileHash, size: u64) -> Result<()> {
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0)
            });
        {
            let mut items = self.items.lock();
            items.retain(|item| item.hash != hash);
            items.push(ShareItem {
                path,
                hash,
                size,
                modified,
                method: self.method_flag,
                lent: None,
            });
        }
        self.save()
    }

    pub fn remove(&self, hash: &FileHash) -> Result<()> {
        self.items.lock().retain(|item| &item.hash != hash);
        self.save()
    }

    /// Mark every file of a lent item: the local copies are deleted, the
    /// metadata stays so the return can restore it.
    pub fn mark_lent(&self, hash: &FileHash, borrow_key: &str) -> Result<()> {
        {
            let mut items = self.items.lock();
            for item in items.iter_mut().filter(|i| &i.hash == hash) {
                item.lent = Some(borrow_key.to_string());
                if let Err(e) = std::fs::remove_file(&item.path) {
                    debug!("removing lent file {} failed: {e}", item.path.display());
                }
            }
        }
        self.save()
    }

    /// Clear the lent marker after the borrower returned the files.
    pub fn clear_lent(&self, borrow_key: &str) -> Result<()> {
        {
            let mut items = self.items.lock();
            for item in items.iter_mut() {
                if item.lent.as_deref() == Some(borrow_key) {
                    item.lent = None;
                }
            }
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        let items = self.items.lock().clone();
        let xml = write_share_xml(&items)?;
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.file_path, xml)?;
        Ok(())
    }
}

impl FileMethod for ShareList {
    fn flags(&self) -> u32 {
        self.method_flag
    }

    /// Lent items do not serve; their files are gone from disk.
    fn search(&self, hash: &FileHash, size: u64) -> Option<PathBuf> {
        self.items
            .lock()
            .iter()
            .find(|item| &item.hash == hash && item.size == size && item.lent.is_none())
            .map(|item| item.path.clone())
    }
}

/// Hash a file on disk the way peers identify it: streaming SHA-1,
/// rendered as the 40-hex key. Returns the hash and the file size.
pub fn hash_file(path: &Path) -> Result<(FileHash, u64)> {
    use sha1::{Digest, Sha1};
    use std::io::Read;

    let mut file = std::fs::File::open(path)
        .map_err(|e| Error::Storage(format!("open {}: {e}", path.display())))?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::Storage(format!("read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    let hash = FileHash::new(hex::encode(hasher.finalize()))?;
    Ok((hash, total))
}

impl ShareList {
    /// Hash and share a file in one step.
    pub fn share_file(&self, path: PathBuf) -> Result<ShareItem> {
        let (hash, size) = hash_file(&path)?;
        self.add(path, hash.clone(), size)?;
        self.items
            .lock()
            .iter()
            .find(|item| item.hash == hash)
            .cloned()
            .ok_or_else(|| Error::protocol("freshly shared item vanished"))
    }
}

/// Convenience constructors for the two concrete lists.
pub fn temp_share_list(user_dir: &Path) -> ShareList {
    ShareList::load(user_dir.join("temp_shares.xml"), search_flags::TEMP)
}

pub fn off_catalog_share_list(user_dir: &Path) -> ShareList {
    ShareList::load(user_dir.join("off_shares.xml"), search_flags::OFF_CATALOG)
}

// ---------------------------------------------------------------------------
// XML codec
// ---------------------------------------------------------------------------

fn write_share_xml(items: &[ShareItem]) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(XmlEvent::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;
    writer
        .write_event(XmlEvent::Start(BytesStart::new("share")))
        .map_err(xml_err)?;
    for item in items {
        writer
            .write_event(XmlEvent::Start(BytesStart::new("shareItem")))
            .map_err(xml_err)?;
        write_text_element(&mut writer, "path", &item.path.to_string_lossy())?;
        write_text_element(&mut writer, "hash", item.hash.as_str())?;
        write_text_element(&mut writer, "size", &item.size.to_string())?;
        write_text_element(&mut writer, "modified", &item.modified.to_string())?;
        write_text_element(&mut writer, "method", &item.method.to_string())?;
        if let Some(lent) = &item.lent {
            write_text_element(&mut writer, "lent", lent)?;
        }
        writer
            .write_event(XmlEvent::End(BytesEnd::new("shareItem")))
            .map_err(xml_err)?;
    }
    writer
        .write_event(XmlEvent::End(BytesEnd::new("share")))
        .map_err(xml_err)?;
    String::from_utf8(writer.into_inner()).map_err(|e| Error::protocol(e.to_string()))
}

fn write_text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<()> {
    writer
        .write_event(XmlEvent::Start(BytesStart::new(name)))
        .map_err(xml_err)?;
    writer
        .write_event(XmlEvent::Text(BytesText::new(text)))
        .map_err(xml_err)?;
    writer
        .write_event(XmlEvent::End(BytesEnd::new(name)))
        .map_err(xml_err)?;
    Ok(())
}

fn xml_err<E: std::fmt::Display>(e: E) -> Error {
    Error::protocol(format!("share xml: {e}"))
}

fn parse_share_xml(text: &str) -> Result<Vec<ShareItem>> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut items = Vec::new();
    let mut element = String::new();
    let mut path: Option<PathBuf> = None;
    let mut hash: Option<FileHash> = None;
    let mut size: u64 = 0;
    let mut modified: u64 = 0;
    let mut method: u32 = 0;
    let mut lent: Option<String> = None;

    loop {
        match reader.read_event().map_err(xml_err)? {
            XmlEvent::Start(e) => {
                element = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if element == "shareItem" {
                    path = None;
                    hash = None;
                    size = 0;
                    modified = 0;
                    method = 0;
                    lent = None;
                }
            }
            XmlEvent::Text(t) => {
                let text = t.unescape().map_err(xml_err)?.to_string();
                match element.as_str() {
                    "path" => path = Some(PathBuf::from(&text)),
                    "hash" => hash = FileHash::new(&text).ok(),
                    "size" => size = text.parse().unwrap_or(0),
                    "modified" => modified = text.parse().unwrap_or(0),
                    "method" => method = text.parse().unwrap_or(0),
                    "lent" => lent = Some(text),
                    _ => {}
                }
            }
            XmlEvent::End(e) => {
                if e.name().as_ref() == b"shareItem" {
                    if let (Some(path), Some(hash)) = (path.take(), hash.take()) {
                        items.push(ShareItem {
                            path,
                            hash,
                            size,
                            modified,
                            method,
                            lent: lent.take(),
                        });
                    } else {
                        debug!("skipping shareItem without path or hash");
                    }
                }
                element.clear();
            }
            XmlEvent::Eof => break,
            _ => {}
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn hash(tag: &str) -> FileHash {
        FileHash::new(tag.repeat(20)).unwrap()
    }

    #[test]
    fn xml_roundtrip_preserves_items() {
        let items = vec![
            ShareItem {
                path: PathBuf::from("/data/one.bin"),
                hash: hash("aa"),
                size: 123,
                modified: 1700000000,
                method: search_flags::TEMP,
                lent: None,
            },
            ShareItem {
                path: PathBuf::from("/data/two.bin"),
                hash: hash("bb"),
                size: 456,
                modified: 1700000001,
                method: search_flags::OFF_CATALOG,
                lent: Some("key-9".into()),
            },
        ];
        let xml = write_share_xml(&items).unwrap();
        assert!(xml.contains("<share>"));
        assert!(xml.contains("<shareItem>"));
        assert!(xml.contains("<lent>key-9</lent>"));
        let parsed = parse_share_xml(&xml).unwrap();
        assert_eq!(parsed, items);
    }

    #[test]
    fn list_persists_across_reload() {
        let dir = tempdir().unwrap();
        let shared = dir.path().join("payload.bin");
        std::fs::write(&shared, b"hello").unwrap();

        let list = temp_share_list(dir.path());
        list.add(shared.clone(), hash("cc"), 5).unwrap();

        let reloaded = temp_share_list(dir.path());
        let items = reloaded.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, shared);
        assert_eq!(items[0].size, 5);
    }

    #[test]
    fn search_skips_lent_items() {
        let dir = tempdir().unwrap();
        let shared = dir.path().join("lendable.bin");
        std::fs::write(&shared, b"content").unwrap();

        let list = off_catalog_share_list(dir.path());
        list.add(shared.clone(), hash("dd"), 7).unwrap();
        assert_eq!(list.search(&hash("dd"), 7), Some(shared.clone()));
        // Wrong size misses.
        assert_eq!(list.search(&hash("dd"), 8), None);

        list.mark_lent(&hash("dd"), "key-1").unwrap();
        assert_eq!(list.search(&hash("dd"), 7), None);
        assert!(!shared.exists(), "lent file removed from disk");

        // Metadata survived; the return restores visibility.
        list.clear_lent("key-1").unwrap();
        assert_eq!(list.search(&hash("dd"), 7), Some(shared));
    }

    #[test]
    fn hash_file_matches_known_vector() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        let (hash, size) = hash_file(&path).unwrap();
        assert_eq!(hash.as_str(), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(size, 3);
    }

    #[test]
    fn share_file_hashes_and_registers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"some payload bytes").unwrap();
        let list = temp_share_list(dir.path());
        let item = list.share_file(path.clone()).unwrap();
        assert_eq!(item.size, 18);
        assert_eq!(list.search(&item.hash, item.size), Some(path));
    }

    #[test]
    fn add_replaces_same_hash() {
        let dir = tempdir().unwrap();
        let list = temp_share_list(dir.path());
        list.add(PathBuf::from("/a"), hash("ee"), 1).unwrap();
        list.add(PathBuf::from("/b"), hash("ee"), 2).unwrap();
        let items = list.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, PathBuf::from("/b"));
    }
}
