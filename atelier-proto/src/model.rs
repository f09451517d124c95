//! Room, user and file descriptors shared by every session kind.
//!
//! Capability is derived, never stored: both the editor binding and the
//! terminal controller resolve it through [`Capability::resolve`] so the two
//! enforce one consistent policy.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a file-tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Directory,
}

/// Descriptor of a file-tree entry, as handed over by the file-tree layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    pub kind: NodeKind,
}

impl FileNode {
    pub fn file(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(path.as_str())
            .to_string();
        Self {
            name,
            path,
            kind: NodeKind::File,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }
}

/// Stable per-file identifier derived from the path.
///
/// Path separators are flattened to `_` so the id is usable as a routing
/// key on both sides of the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    pub fn from_path(path: &str) -> Self {
        Self(path.replace(['/', '\\'], "_"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity facts about the local user, provided by the auth layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Uuid,
    pub name: String,
    pub is_admin: bool,
}

impl UserInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            is_admin: false,
        }
    }
}

/// Facts about a room, provided by the room layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    /// Users explicitly granted write access (beyond owner and admins).
    pub contributors: Vec<Uuid>,
}

impl RoomInfo {
    pub fn new(name: impl Into<String>, owner_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner_id,
            contributors: Vec::new(),
        }
    }
}

/// Write capability of a user within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Contributor,
    Viewer,
}

impl Capability {
    /// The single capability-resolution rule: admins, the room owner and
    /// explicitly granted users are contributors; everyone else views.
    pub fn resolve(user: &UserInfo, room: &RoomInfo) -> Self {
        if user.is_admin || room.owner_id == user.id || room.contributors.contains(&user.id) {
            Capability::Contributor
        } else {
            Capability::Viewer
        }
    }

    pub fn can_write(self) -> bool {
        matches!(self, Capability::Contributor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_flattens_separators() {
        assert_eq!(FileId::from_path("src/main.py").as_str(), "src_main.py");
        assert_eq!(FileId::from_path("src\\main.py").as_str(), "src_main.py");
        assert_eq!(FileId::from_path("main.py").as_str(), "main.py");
    }

    #[test]
    fn test_file_node_name_from_path() {
        let node = FileNode::file("src/nested/main.py");
        assert_eq!(node.name, "main.py");
        assert!(node.is_file());
    }

    #[test]
    fn test_owner_is_contributor() {
        let user = UserInfo::new("alice");
        let room = RoomInfo::new("demo", user.id);
        assert_eq!(Capability::resolve(&user, &room), Capability::Contributor);
    }

    #[test]
    fn test_admin_is_contributor_everywhere() {
        let mut user = UserInfo::new("root");
        user.is_admin = true;
        let room = RoomInfo::new("demo", Uuid::new_v4());
        assert!(Capability::resolve(&user, &room).can_write());
    }

    #[test]
    fn test_granted_user_is_contributor() {
        let user = UserInfo::new("bob");
        let mut room = RoomInfo::new("demo", Uuid::new_v4());
        room.contributors.push(user.id);
        assert!(Capability::resolve(&user, &room).can_write());
    }

    #[test]
    fn test_everyone_else_is_viewer() {
        let user = UserInfo::new("carol");
        let room = RoomInfo::new("demo", Uuid::new_v4());
        assert_eq!(Capability::resolve(&user, &room), Capability::Viewer);
        assert!(!Capability::Viewer.can_write());
    }
}
