use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::types::Transaction;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    created_at: DateTime<Utc>,
    transactions: Vec<Transaction>,
}

/// Snapshot name used when the caller supplies none.
pub fn default_name(now: DateTime<Utc>) -> String {
    format!("snapshot_{}", now.format("%Y%m%d_%H%M%S"))
}

pub(crate) fn write(dir: &str, name: &str, transactions: &[Transaction]) -> Result<PathBuf, GraphError> {
    let now = Utc::now();
    let name = if name.trim().is_empty() {
        default_name(now)
    } else {
        name.trim().to_string()
    };
    if name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(GraphError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid snapshot name '{}'", name),
        )));
    }

    fs::create_dir_all(dir)?;
    let path = Path::new(dir).join(format!("{}.json", name));
    // Write beside the target and rename so a crash never leaves a torn snapshot.
    let tmp = path.with_extension("json.tmp");

    let file = SnapshotFile {
        version: SNAPSHOT_VERSION,
        created_at: now,
        transactions: transactions.to_vec(),
    };
    {
        let mut writer = BufWriter::new(fs::File::create(&tmp)?);
        serde_json::to_writer(&mut writer, &file)?;
        writer.flush()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(path)
}

pub(crate) fn read(path: &Path) -> Result<Vec<Transaction>, GraphError> {
    let reader = BufReader::new(fs::File::open(path)?);
    let file: SnapshotFile = serde_json::from_reader(reader)?;
    if file.version != SNAPSHOT_VERSION {
        return Err(GraphError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported snapshot version {}", file.version),
        )));
    }
    Ok(file.transactions)
}
