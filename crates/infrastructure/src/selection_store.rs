//! 把最近选中的会话保存在本地 JSON 文件里

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use application::{SelectionStore, StorageError};
use domain::ConversationId;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectionFile {
    #[serde(default)]
    last_selected_conversation: Option<ConversationId>,
}

#[derive(Debug, Clone)]
pub struct FileSelectionStore {
    path: PathBuf,
}

impl FileSelectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, file: &SelectionFile) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let bytes =
            serde_json::to_vec_pretty(file).map_err(|err| StorageError::Io(err.to_string()))?;
        // 先写临时文件再改名，避免留下写了一半的文件
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(io_error)?;
        fs::rename(&tmp, &self.path).map_err(io_error)
    }
}

fn io_error(err: std::io::Error) -> StorageError {
    StorageError::Io(err.to_string())
}

impl SelectionStore for FileSelectionStore {
    fn load(&self) -> Result<Option<ConversationId>, StorageError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(err)),
        };
        let file: SelectionFile = serde_json::from_slice(&bytes)
            .map_err(|err| StorageError::Corrupt(err.to_string()))?;
        Ok(file.last_selected_conversation)
    }

    fn save(&self, conversation_id: &ConversationId) -> Result<(), StorageError> {
        debug!(conversation_id = %conversation_id, path = %self.path.display(), "保存选中会话");
        self.write(&SelectionFile {
            last_selected_conversation: Some(conversation_id.clone()),
        })
    }

    fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(err)),
        }
    }
}
