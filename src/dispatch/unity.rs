//! Typed helpers for the Unity editor.
//!
//! Thin wrappers over [`Dispatcher`] that pin the platform to Unity and turn
//! payloads into concrete Rust types. An application failure reported by the
//! editor surfaces as `DispatchError::Application`.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::dispatcher::Dispatcher;
use super::errors::DispatchError;
use super::registry::{Command, Platform};
use super::types::DecodedResponse;

/// Project metadata reported by the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub project_root: String,
    #[serde(default)]
    pub project_name: Option<String>,
    /// Fields this crate does not model, kept as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ProjectInfo {
    /// Absolute filesystem path of an asset path such as `Assets/Models/a.fbx`.
    pub fn absolute_asset_path(&self, asset_path: &str) -> PathBuf {
        Path::new(&self.project_root).join(asset_path)
    }
}

/// A Unity editor reached through a dispatcher.
#[derive(Debug, Clone)]
pub struct UnityEditor {
    dispatcher: Dispatcher,
}

impl UnityEditor {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn invoke(&self, command: Command, params: Vec<Value>) -> Result<DecodedResponse, DispatchError> {
        self.dispatcher
            .dispatch(command, params, Some(Platform::Unity), None)
    }

    fn invoke_as<T: DeserializeOwned>(
        &self,
        command: Command,
        params: Vec<Value>,
    ) -> Result<T, DispatchError> {
        let response = self.invoke(command, params)?;
        let method = response.method.clone();
        let payload = response.into_payload()?;
        serde_json::from_value(payload).map_err(|e| DispatchError::Unmarshal {
            type_url: method,
            reason: format!("unexpected payload shape: {e}"),
        })
    }

    pub fn project_info(&self) -> Result<ProjectInfo, DispatchError> {
        self.invoke_as(Command::SystemGetProjectinfo, vec![])
    }

    /// Ask the asset database to pick up changes on disk.
    pub fn refresh(&self) -> Result<(), DispatchError> {
        self.invoke(Command::UnityEditorAssetdatabaseRefresh, vec![])?
            .into_payload()
            .map(|_| ())
    }

    pub fn import_asset(&self, asset_path: &str) -> Result<(), DispatchError> {
        self.invoke(Command::UnityEditorImportAsset, vec![json!(asset_path)])?
            .into_payload()
            .map(|_| ())
    }

    /// Copy an asset; returns whatever the editor reports (usually a bool).
    pub fn copy_asset(&self, from: &str, to: &str) -> Result<Value, DispatchError> {
        self.invoke(
            Command::UnityEditorAssetdatabaseCopyAsset,
            vec![json!(from), json!(to)],
        )?
        .into_payload()
    }

    /// GUIDs of assets matching `filter` under `paths`.
    pub fn find_asset_guids(&self, filter: &str, paths: &[&str]) -> Result<Vec<String>, DispatchError> {
        self.invoke_as(
            Command::UnityEditorAssetdatabaseFindAssets,
            vec![json!(filter), json!(paths)],
        )
    }

    pub fn guid_to_path(&self, guid: &str) -> Result<String, DispatchError> {
        self.invoke_as(Command::UnityEditorAssetdatabaseGuidToPath, vec![json!(guid)])
    }

    /// Asset paths matching `filter`: one GUID query, then one path lookup per GUID.
    pub fn find_assets(&self, filter: &str, paths: &[&str]) -> Result<Vec<String>, DispatchError> {
        let guids = self.find_asset_guids(filter, paths)?;
        tracing::debug!(filter, matches = guids.len(), "resolving asset guids");
        guids.iter().map(|guid| self.guid_to_path(guid)).collect()
    }
}
