use crate::error::{ControllerError, ControllerResult};
use crate::operation::state::OperationState;

const SNAPSHOT_MAGIC: &[u8; 8] = b"KEELSNAP";
const SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_HEADER_LEN: usize = 12;

/// Serializes the persisted portion of an operation state into a versioned
/// blob. The volatile scheduling collections are rebuilt on load, so a
/// round trip reproduces an operationally equivalent schedule state.
pub fn save(state: &OperationState) -> ControllerResult<Vec<u8>> {
    let mut blob = Vec::new();
    blob.extend_from_slice(SNAPSHOT_MAGIC);
    blob.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    serde_json::to_writer(&mut blob, state)?;
    Ok(blob)
}

pub fn load(blob: &[u8]) -> ControllerResult<OperationState> {
    if blob.len() < SNAPSHOT_HEADER_LEN {
        return Err(ControllerError::MalformedSnapshot(
            "snapshot is too short".to_string(),
        ));
    }
    if &blob[0..8] != SNAPSHOT_MAGIC {
        return Err(ControllerError::MalformedSnapshot(
            "bad snapshot magic".to_string(),
        ));
    }
    let version = u32::from_le_bytes(
        blob[8..SNAPSHOT_HEADER_LEN]
            .try_into()
            .map_err(|_| ControllerError::MalformedSnapshot("bad snapshot header".to_string()))?,
    );
    if version != SNAPSHOT_VERSION {
        return Err(ControllerError::MalformedSnapshot(format!(
            "unsupported snapshot version {version}"
        )));
    }
    let state = serde_json::from_slice(&blob[SNAPSHOT_HEADER_LEN..])?;
    Ok(state)
}
