use crate::session::KItemKey;
use std::fmt;

/// Reason recorded for operations that were not attempted because an
/// operation they depend on failed
pub const SKIPPED: &str = "skipped";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CreateKType,
    UpdateKType,
    DeleteKType,
    CreateAppConfig,
    UpdateAppConfig,
    DeleteAppConfig,
    CreateKItem,
    PatchKItem,
    UploadAttachment,
    UploadDataFrame,
    UploadAvatar,
    DeleteAttachment,
    DeleteDataFrame,
    DeleteKItem,
    Refresh,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OperationKind::CreateKType => "create ktype",
            OperationKind::UpdateKType => "update ktype",
            OperationKind::DeleteKType => "delete ktype",
            OperationKind::CreateAppConfig => "create app config",
            OperationKind::UpdateAppConfig => "update app config",
            OperationKind::DeleteAppConfig => "delete app config",
            OperationKind::CreateKItem => "create kitem",
            OperationKind::PatchKItem => "patch kitem",
            OperationKind::UploadAttachment => "upload attachment",
            OperationKind::UploadDataFrame => "upload dataframe",
            OperationKind::UploadAvatar => "upload avatar",
            OperationKind::DeleteAttachment => "delete attachment",
            OperationKind::DeleteDataFrame => "delete dataframe",
            OperationKind::DeleteKItem => "delete kitem",
            OperationKind::Refresh => "refresh",
        };
        f.write_str(label)
    }
}

/// One remote operation of a commit pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOperation {
    pub kind: OperationKind,
    /// Item name, `item/attachment`, knowledge type id or app name
    pub target: String,
    /// Session handle of the item the operation belongs to
    pub kitem: Option<KItemKey>,
}

impl fmt::Display for CommitOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} `{}`", self.kind, self.target)?;
        if let Some(key) = self.kitem {
            write!(f, " ({})", key)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitFailure {
    pub operation: CommitOperation,
    pub reason: String,
}

impl CommitFailure {
    pub fn is_skipped(&self) -> bool {
        self.reason == SKIPPED
    }
}

/// Outcome of a commit pass: what went through and what did not
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub succeeded: Vec<CommitOperation>,
    pub failed: Vec<CommitFailure>,
}

impl CommitReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }

    pub(crate) fn success(&mut self, kind: OperationKind, target: impl Into<String>) {
        self.succeeded.push(CommitOperation {
            kind,
            target: target.into(),
            kitem: None,
        });
    }

    pub(crate) fn success_for(&mut self, key: KItemKey, kind: OperationKind, target: impl Into<String>) {
        self.succeeded.push(CommitOperation {
            kind,
            target: target.into(),
            kitem: Some(key),
        });
    }

    pub(crate) fn failure(&mut self, kind: OperationKind, target: impl Into<String>, reason: impl Into<String>) {
        self.failed.push(CommitFailure {
            operation: CommitOperation {
                kind,
                target: target.into(),
                kitem: None,
            },
            reason: reason.into(),
        });
    }

    pub(crate) fn failure_for(
        &mut self,
        key: KItemKey,
        kind: OperationKind,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) {
        self.failed.push(CommitFailure {
            operation: CommitOperation {
                kind,
                target: target.into(),
                kitem: Some(key),
            },
            reason: reason.into(),
        });
    }

    pub fn succeeded_with(&self, kind: OperationKind) -> impl Iterator<Item = &CommitOperation> {
        self.succeeded.iter().filter(move |op| op.kind == kind)
    }

    pub fn failed_with(&self, kind: OperationKind) -> impl Iterator<Item = &CommitFailure> {
        self.failed.iter().filter(move |f| f.operation.kind == kind)
    }

    /// Whether any operation on `target` failed or was skipped
    pub fn has_failed(&self, target: &str) -> bool {
        self.failed.iter().any(|f| f.operation.target == target)
    }

    /// Failed or skipped operations of one item
    pub fn failures_of(&self, key: KItemKey) -> impl Iterator<Item = &CommitFailure> {
        self.failed.iter().filter(move |f| f.operation.kitem == Some(key))
    }
}

impl fmt::Display for CommitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} succeeded, {} failed", self.succeeded.len(), self.failed.len())?;
        for operation in &self.succeeded {
            writeln!(f, "  ok     {}", operation)?;
        }
        for failure in &self.failed {
            writeln!(f, "  failed {}: {}", failure.operation, failure.reason)?;
        }
        Ok(())
    }
}
