//! `.cgc` container: a gzip-compressed tar whose entries appear in a fixed order.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;

use super::BundleError;

pub const METADATA: &str = "metadata.json";
pub const SCHEMA: &str = "schema.json";
pub const NODES: &str = "nodes.jsonl";
pub const EDGES: &str = "edges.jsonl";
pub const STATS: &str = "stats.json";

/// Entry order every bundle follows: nodes strictly before edges.
pub const ENTRY_ORDER: [&str; 5] = [METADATA, SCHEMA, NODES, EDGES, STATS];

/// Body of one entry: its length and a reader over it.
pub struct EntryBody<'a> {
    len: u64,
    reader: Box<dyn Read + 'a>,
}

impl<'a> EntryBody<'a> {
    pub fn bytes(data: &'a [u8]) -> Self {
        Self {
            len: data.len() as u64,
            reader: Box::new(data),
        }
    }

    /// A spooled file, rewound to its start.
    pub fn spool(file: &'a mut File) -> Result<Self, BundleError> {
        file.flush()?;
        let len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Self {
            len,
            reader: Box::new(BufReader::new(file)),
        })
    }
}

/// Write the five entries in [`ENTRY_ORDER`].
///
/// The archive is staged beside `out` and renamed into place once complete,
/// so a failed write never leaves a truncated bundle.
pub fn write_archive(out: &Path, entries: [(&str, EntryBody<'_>); 5]) -> Result<(), BundleError> {
    let dir = match out.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let staging = NamedTempFile::new_in(dir)?;

    let mtime = chrono::Utc::now().timestamp().max(0) as u64;
    let encoder = GzEncoder::new(staging.as_file(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for ((name, body), expected) in entries.into_iter().zip(ENTRY_ORDER) {
        if name != expected {
            return Err(BundleError::Format(format!(
                "entry {} written out of order, expected {}",
                name, expected
            )));
        }
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        builder.append_data(&mut header, name, body.reader)?;
    }
    builder.into_inner()?.finish()?;
    staging.persist(out).map_err(|e| e.error)?;
    Ok(())
}

/// Sequential reader over a bundle's entries.
pub struct BundleReader {
    archive: tar::Archive<GzDecoder<File>>,
}

impl BundleReader {
    pub fn open(path: &Path) -> Result<Self, BundleError> {
        let file = File::open(path)?;
        Ok(Self {
            archive: tar::Archive::new(GzDecoder::new(file)),
        })
    }

    /// Visit entries in order, requiring each to carry the expected name.
    ///
    /// `visit` receives the entry name and a buffered reader over its body.
    pub fn for_each_entry(
        &mut self,
        mut visit: impl FnMut(&str, &mut dyn BufRead) -> Result<(), BundleError>,
    ) -> Result<(), BundleError> {
        let mut expected = ENTRY_ORDER.iter();
        for entry in self.archive.entries()? {
            let entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            match expected.next() {
                Some(&want) if want == name => {}
                Some(&want) => {
                    return Err(BundleError::Format(format!(
                        "expected entry {}, found {}",
                        want, name
                    )))
                }
                None => {
                    return Err(BundleError::Format(format!("unexpected entry {}", name)));
                }
            }
            let mut reader = BufReader::new(entry);
            visit(&name, &mut reader)?;
        }
        if let Some(missing) = expected.next() {
            return Err(BundleError::Format(format!("bundle is missing {}", missing)));
        }
        Ok(())
    }
}

/// Read a whole small entry (metadata, schema, stats) as JSON.
pub fn read_json<T: serde::de::DeserializeOwned>(
    name: &str,
    reader: &mut dyn BufRead,
) -> Result<T, BundleError> {
    let mut raw = String::new();
    reader.read_to_string(&mut raw)?;
    serde_json::from_str(&raw).map_err(|e| BundleError::Format(format!("{}: {}", name, e)))
}
