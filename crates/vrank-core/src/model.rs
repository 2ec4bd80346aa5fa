use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Task,
    Project,
    Workflow,
}

impl ItemKind {
    pub const ALL: [ItemKind; 3] = [ItemKind::Task, ItemKind::Project, ItemKind::Workflow];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Task => "task",
            ItemKind::Project => "project",
            ItemKind::Workflow => "workflow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task" => Some(ItemKind::Task),
            "project" => Some(ItemKind::Project),
            "workflow" => Some(ItemKind::Workflow),
            _ => None,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    Completed,
    Archived,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    NotStarted,
    InProgress,
    OnHold,
    Completed,
    Archived,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Archived,
}

/// Lifecycle status tagged with the kind it belongs to, so an item's kind
/// and status can never disagree.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Task(TaskStatus),
    Project(ProjectStatus),
    Workflow(WorkflowStatus),
}

impl ItemStatus {
    pub fn kind(&self) -> ItemKind {
        match self {
            ItemStatus::Task(_) => ItemKind::Task,
            ItemStatus::Project(_) => ItemKind::Project,
            ItemStatus::Workflow(_) => ItemKind::Workflow,
        }
    }

    /// Terminal items live in the pinned bucket (rank 0).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Task(TaskStatus::Completed | TaskStatus::Archived)
                | ItemStatus::Project(ProjectStatus::Completed | ProjectStatus::Archived)
                | ItemStatus::Workflow(WorkflowStatus::Completed | WorkflowStatus::Archived)
        )
    }
}

/// The access level named by a permission slug suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Access {
    /// `<kind>-view-all`
    ViewAll,
    /// `<kind>-view`
    View,
    /// `<kind>-view-archived`
    ViewArchived,
}

/// A permission slug such as `task-view-all`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slug {
    pub kind: ItemKind,
    pub access: Access,
}

impl Slug {
    pub fn new(kind: ItemKind, access: Access) -> Self {
        Self { kind, access }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (kind, rest) = s.split_once('-')?;
        let kind = ItemKind::parse(kind)?;
        let access = match rest {
            "view-all" => Access::ViewAll,
            "view" => Access::View,
            "view-archived" => Access::ViewArchived,
            _ => return None,
        };
        Some(Self { kind, access })
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self.access {
            Access::ViewAll => "view-all",
            Access::View => "view",
            Access::ViewArchived => "view-archived",
        };
        write!(f, "{}-{}", self.kind.as_str(), suffix)
    }
}

impl TryFrom<String> for Slug {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Slug::parse(&value).ok_or_else(|| format!("unknown permission slug: {value}"))
    }
}

impl From<Slug> for String {
    fn from(slug: Slug) -> Self {
        slug.to_string()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MembershipChange {
    Added,
    Removed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_round_trips_through_display() {
        for kind in ItemKind::ALL {
            for access in [Access::ViewAll, Access::View, Access::ViewArchived] {
                let slug = Slug::new(kind, access);
                assert_eq!(Slug::parse(&slug.to_string()), Some(slug));
            }
        }
    }

    #[test]
    fn slug_rejects_unknown_suffix() {
        assert_eq!(Slug::parse("task-edit"), None);
        assert_eq!(Slug::parse("ticket-view"), None);
        assert_eq!(Slug::parse("task"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(ItemStatus::Task(TaskStatus::Completed).is_terminal());
        assert!(ItemStatus::Project(ProjectStatus::Archived).is_terminal());
        assert!(ItemStatus::Workflow(WorkflowStatus::Completed).is_terminal());
        assert!(!ItemStatus::Task(TaskStatus::InReview).is_terminal());
        assert!(!ItemStatus::Project(ProjectStatus::OnHold).is_terminal());
        assert!(!ItemStatus::Workflow(WorkflowStatus::Paused).is_terminal());
    }
}
