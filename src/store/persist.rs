use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

use crate::error::CoreResult;

/// Replace `path` with the JSON encoding of `value` (temp file + rename)
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> CoreResult<()> {
    let contents = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");

    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;

    Ok(())
}

/// Read a JSON ledger, treating a missing file as empty
pub async fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> CoreResult<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}
