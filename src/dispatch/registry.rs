//! Command registry — maps abstract commands to platform-specific method names.
//!
//! Provides:
//! - The closed set of `Command` identifiers and `Platform` tags
//! - A two-level `(command, platform) → method name` table, frozen after build
//! - Resolution that fails loudly on a miss instead of borrowing another
//!   platform's entry

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DispatchError;

// ─── Platform ────────────────────────────────────────────────────────────────

/// Host-application kind a remote call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Unknown,
    Unity,
    Unreal,
    Godot,
    Blender,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Unknown,
        Platform::Unity,
        Platform::Unreal,
        Platform::Godot,
        Platform::Blender,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Unknown => "unknown",
            Platform::Unity => "unity",
            Platform::Unreal => "unreal",
            Platform::Godot => "godot",
            Platform::Blender => "blender",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown platform: '{s}'"))
    }
}

// ─── Command ─────────────────────────────────────────────────────────────────

/// Stable symbolic name for an abstract remote operation.
///
/// Published names are never repurposed. New operations get new variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    SystemGetProjectinfo,
    SceneClone,

    // UnityEditor built-in static methods
    UnityEditorImportAsset,
    UnityEditorMoveAsset,
    UnityEditorAssetdatabaseRefresh,
    UnityEditorAssetdatabaseCopyAsset,
    UnityEditorAssetdatabaseGuidToPath,
    UnityEditorAssetdatabaseFindAssets,
    UnityEditorAssetdatabaseGetDependencies,
    UnityEditorScenemanagerOpen,
    UnityEditorScenemanagerSave,

    // Prefab utilities
    UnityPrefabCreate,
    UnityPrefabMerge,
    UnityPrefabAddComponent,
    UnityPrefabSetValue,
    UnityPrefabSetReferenceValue,
    UnityPrefabCreateMeshColliderObject,

    // Material utilities
    UnityMaterialUpdateTextures,
}

impl Command {
    pub const ALL: [Command; 18] = [
        Command::SystemGetProjectinfo,
        Command::SceneClone,
        Command::UnityEditorImportAsset,
        Command::UnityEditorMoveAsset,
        Command::UnityEditorAssetdatabaseRefresh,
        Command::UnityEditorAssetdatabaseCopyAsset,
        Command::UnityEditorAssetdatabaseGuidToPath,
        Command::UnityEditorAssetdatabaseFindAssets,
        Command::UnityEditorAssetdatabaseGetDependencies,
        Command::UnityEditorScenemanagerOpen,
        Command::UnityEditorScenemanagerSave,
        Command::UnityPrefabCreate,
        Command::UnityPrefabMerge,
        Command::UnityPrefabAddComponent,
        Command::UnityPrefabSetValue,
        Command::UnityPrefabSetReferenceValue,
        Command::UnityPrefabCreateMeshColliderObject,
        Command::UnityMaterialUpdateTextures,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::SystemGetProjectinfo => "system_get_projectinfo",
            Command::SceneClone => "scene_clone",
            Command::UnityEditorImportAsset => "unity_editor_import_asset",
            Command::UnityEditorMoveAsset => "unity_editor_move_asset",
            Command::UnityEditorAssetdatabaseRefresh => "unity_editor_assetdatabase_refresh",
            Command::UnityEditorAssetdatabaseCopyAsset => "unity_editor_assetdatabase_copy_asset",
            Command::UnityEditorAssetdatabaseGuidToPath => {
                "unity_editor_assetdatabase_guid_to_path"
            }
            Command::UnityEditorAssetdatabaseFindAssets => "unity_editor_assetdatabase_find_assets",
            Command::UnityEditorAssetdatabaseGetDependencies => {
                "unity_editor_assetdatabase_get_dependencies"
            }
            Command::UnityEditorScenemanagerOpen => "unity_editor_scenemanager_open",
            Command::UnityEditorScenemanagerSave => "unity_editor_scenemanager_save",
            Command::UnityPrefabCreate => "unity_prefab_create",
            Command::UnityPrefabMerge => "unity_prefab_merge",
            Command::UnityPrefabAddComponent => "unity_prefab_add_component",
            Command::UnityPrefabSetValue => "unity_prefab_set_value",
            Command::UnityPrefabSetReferenceValue => "unity_prefab_set_reference_value",
            Command::UnityPrefabCreateMeshColliderObject => {
                "unity_prefab_create_mesh_collider_object"
            }
            Command::UnityMaterialUpdateTextures => "unity_material_update_textures",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown command: '{s}'"))
    }
}

// ─── Built-in table ──────────────────────────────────────────────────────────

const UNITY_METHODS: [(Command, &str); 18] = [
    (Command::SystemGetProjectinfo, "UGrpc.SystemUtils.GetProjectInfo"),
    (Command::SceneClone, "UGrpc.SceneUtils.SceneClone"),
    (Command::UnityEditorMoveAsset, "UnityEditor.AssetDatabase.MoveAsset"),
    (Command::UnityEditorImportAsset, "UnityEditor.AssetDatabase.ImportAsset"),
    (Command::UnityEditorAssetdatabaseRefresh, "UnityEditor.AssetDatabase.Refresh"),
    (Command::UnityEditorAssetdatabaseCopyAsset, "UnityEditor.AssetDatabase.CopyAsset"),
    (Command::UnityEditorAssetdatabaseGuidToPath, "UnityEditor.AssetDatabase.GUIDToAssetPath"),
    (Command::UnityEditorAssetdatabaseFindAssets, "UnityEditor.AssetDatabase.FindAssets"),
    (
        Command::UnityEditorAssetdatabaseGetDependencies,
        "UnityEditor.AssetDatabase.GetDependencies",
    ),
    (Command::UnityPrefabCreate, "UGrpc.PrefabUtils.CreateModelAsset"),
    (Command::UnityPrefabMerge, "UGrpc.PrefabUtils.Merge"),
    (Command::UnityPrefabAddComponent, "UGrpc.PrefabUtils.AddComponent"),
    (Command::UnityPrefabSetValue, "UGrpc.PrefabUtils.SetValue"),
    (Command::UnityPrefabSetReferenceValue, "UGrpc.PrefabUtils.SetReferenceValue"),
    (
        Command::UnityPrefabCreateMeshColliderObject,
        "UGrpc.PrefabUtils.CreateMeshColliderObject",
    ),
    (
        Command::UnityEditorScenemanagerOpen,
        "UnityEditor.SceneManagement.EditorSceneManager.OpenScene",
    ),
    (
        Command::UnityEditorScenemanagerSave,
        "UnityEditor.SceneManagement.EditorSceneManager.SaveScene",
    ),
    (Command::UnityMaterialUpdateTextures, "UGrpc.MaterialUtils.UpdateTextures"),
];

// ─── CommandRegistry ─────────────────────────────────────────────────────────

/// Immutable `(command, platform) → method name` table.
///
/// Built once at process start and shared behind an `Arc`. Adding commands or
/// platforms is a data change through [`RegistryBuilder`].
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    /// `command → platform → remote method name`.
    methods: HashMap<Command, HashMap<Platform, String>>,
}

impl CommandRegistry {
    /// The table shipped with the crate.
    pub fn builtin() -> Self {
        Self::builder().with_platform(Platform::Unity, UNITY_METHODS).build()
    }

    /// Start an empty builder.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Start a builder pre-filled with the built-in table.
    pub fn extend_builtin() -> RegistryBuilder {
        RegistryBuilder {
            methods: Self::builtin().methods,
        }
    }

    /// Resolve the remote method name for a command on a platform.
    pub fn resolve(&self, command: Command, platform: Platform) -> Result<&str, DispatchError> {
        self.methods
            .get(&command)
            .and_then(|by_platform| by_platform.get(&platform))
            .map(String::as_str)
            .ok_or(DispatchError::UnsupportedCommand { command, platform })
    }

    /// Whether the pair has an entry.
    pub fn supports(&self, command: Command, platform: Platform) -> bool {
        self.resolve(command, platform).is_ok()
    }

    /// `(command, method)` pairs available on a platform, sorted by command.
    pub fn commands_for(&self, platform: Platform) -> Vec<(Command, &str)> {
        let mut entries: Vec<(Command, &str)> = self
            .methods
            .iter()
            .filter_map(|(cmd, by_platform)| {
                by_platform.get(&platform).map(|m| (*cmd, m.as_str()))
            })
            .collect();
        entries.sort_by_key(|(cmd, _)| *cmd);
        entries
    }

    /// Platforms a command is callable on, sorted.
    pub fn platforms_for(&self, command: Command) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self
            .methods
            .get(&command)
            .map(|by_platform| by_platform.keys().copied().collect())
            .unwrap_or_default();
        platforms.sort();
        platforms
    }

    /// Number of `(command, platform)` entries.
    pub fn len(&self) -> usize {
        self.methods.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collects entries before the registry is frozen.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    methods: HashMap<Command, HashMap<Platform, String>>,
}

impl RegistryBuilder {
    /// Add or replace one entry.
    pub fn with_entry(mut self, command: Command, platform: Platform, method: &str) -> Self {
        self.methods
            .entry(command)
            .or_default()
            .insert(platform, method.to_string());
        self
    }

    /// Add a whole platform table.
    pub fn with_platform<'a>(
        mut self,
        platform: Platform,
        entries: impl IntoIterator<Item = (Command, &'a str)>,
    ) -> Self {
        for (command, method) in entries {
            self = self.with_entry(command, platform, method);
        }
        self
    }

    pub fn build(self) -> CommandRegistry {
        tracing::debug!(
            commands = self.methods.len(),
            "command registry built"
        );
        CommandRegistry {
            methods: self.methods,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
