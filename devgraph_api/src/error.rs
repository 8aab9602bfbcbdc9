use std::fmt::{Debug, Write};
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use crate::primitives::size::Size;

/// A precondition or lifecycle step on a single device failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceError {
    #[error("Device '{name}' has not been created")]
    NotCreated { name: String },
    #[error("Device '{name}' has already been created")]
    AlreadyExists { name: String },
    #[error("Cannot destroy non-leaf device '{name}'")]
    NotLeaf { name: String },
    #[error("Device '{name}' is not controllable")]
    NotControllable { name: String },
    #[error("Device '{name}' is not resizable")]
    NotResizable { name: String },
    #[error("Device '{name}' cannot be sized to {requested}, maximum is {maximum}")]
    SizeConstraint {
        name: String,
        requested: Size,
        maximum: Size,
    },
    #[error(
        "Not enough free space in volume group '{name}': requested {requested}, available {available}"
    )]
    InsufficientSpace {
        name: String,
        requested: Size,
        available: Size,
    },
    #[error("Cannot replace active format on device '{name}'")]
    ActiveFormat { name: String },
    #[error("Cannot activate volume group '{name}' with missing physical volumes")]
    MissingPhysicalVolumes { name: String },
    #[error("No single physical volume in '{name}' has room for {requested}")]
    SinglePhysicalVolume { name: String, requested: Size },
    #[error("Invalid configuration for device '{name}': {reason}")]
    InvalidConfiguration { name: String, reason: String },
    #[error("Failed to create device '{name}'")]
    Create { name: String },
    #[error("Failed to set up device '{name}'")]
    Setup { name: String },
    #[error("Failed to tear down device '{name}'")]
    Teardown { name: String },
    #[error("Failed to destroy device '{name}'")]
    Destroy { name: String },
    #[error("Failed to resize device '{name}'")]
    Resize { name: String },
    #[error("Failed to {operation} format '{format}' on device '{name}'")]
    Format {
        name: String,
        format: String,
        operation: String,
    },
}

/// The device graph or the action list would be left inconsistent.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceTreeError {
    #[error("Device '{name}' has the same path as '{existing}': {path}")]
    DuplicatePath {
        name: String,
        existing: String,
        path: String,
    },
    #[error("Parent '{parent}' of device '{name}' is not in the tree")]
    ParentNotInTree { name: String, parent: String },
    #[error("Mount point '{mountpoint}' is already claimed")]
    MountpointConflict { mountpoint: String },
    #[error("Failed to resolve slave '{slave}' of device '{name}'")]
    UnresolvedSlave { name: String, slave: String },
    #[error("Device '{name}' is not in the tree")]
    NotInTree { name: String },
    #[error("Cannot remove non-leaf device '{name}'")]
    NotLeaf { name: String },
    #[error("Cannot remove extended partition '{name}' while logical partitions exist")]
    ExtendedPartitionInUse { name: String },
    #[error("Device '{member}' is already a member of '{name}'")]
    DuplicateMember { name: String, member: String },
    #[error("No device matches '{spec}'")]
    DeviceNotFound { spec: String },
    #[error("Failed to enumerate block devices")]
    Enumerate,
    #[error("Failed to write configuration file '{path}'")]
    WriteConfig { path: String },
}

/// The in-memory partition table no longer matches the disk. Retryable.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
#[error("Failed to commit partition table to disk '{disk}'")]
pub struct DiskLabelCommitError {
    pub disk: String,
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ActionError {
    #[error("Cannot queue creation of device '{name}': it already exists")]
    DeviceExists { name: String },
    #[error("Device '{name}' does not support resizing")]
    NotResizable { name: String },
    #[error("New size of device '{name}' equals its current size")]
    UnchangedSize { name: String },
    #[error("Format on device '{name}' cannot be migrated")]
    NotMigratable { name: String },
    #[error("Queued actions contain a dependency cycle: {}", actions.join(", "))]
    DependencyCycle { actions: Vec<String> },
    #[error("Failed to execute action '{action}' on device '{device}'")]
    Execute { action: String, device: String },
}

/// User provided input was invalid.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidInputError {
    #[error("Failed to load scan configuration from '{path}'")]
    LoadConfiguration { path: String },
    #[error("Failed to parse scan configuration")]
    ParseConfiguration,
    #[error("Failed to load device descriptors from '{path}'")]
    LoadDescriptors { path: String },
    #[error("Failed to parse device descriptors")]
    ParseDescriptors,
    #[error("Failed to load action requests from '{path}'")]
    LoadActions { path: String },
    #[error("Failed to parse action requests")]
    ParseActions,
    #[error("Action request refers to unknown device '{name}'")]
    UnknownDevice { name: String },
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error("Unknown device id {0}")]
    UnknownDeviceId(u32),
    #[error("Caught panic: {0}")]
    Panic(String),
}

/// Each variant of `ErrorKind` corresponds to a different category of error.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// An operation on a single device failed.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Structural integrity of the device graph was violated.
    #[error(transparent)]
    DeviceTree(#[from] DeviceTreeError),

    /// Stale partition table while executing actions.
    #[error(transparent)]
    DiskLabelCommit(#[from] DiskLabelCommitError),

    /// Registering, ordering or executing actions failed.
    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    /// A bug was encountered.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

#[derive(Debug)]
struct StorageErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

pub struct StorageError(Box<StorageErrorInner>);
impl StorageError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        StorageError(Box::new(StorageErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn internal(message: &'static str) -> Self {
        Self::new(InternalError::Internal(message))
    }

    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        match self.0.source {
            Some(source) => source.context(self.0.kind).context(context.into()),
            None => anyhow::Error::from(self.0.kind).context(context.into()),
        }
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }

    /// Returns true when this error, or anything in its cause chain, is a
    /// partition table commit conflict.
    pub fn is_disklabel_commit(&self) -> bool {
        if matches!(self.0.kind, ErrorKind::DiskLabelCommit(_)) {
            return true;
        }
        self.0.source.as_ref().is_some_and(|source| {
            source.downcast_ref::<DiskLabelCommitError>().is_some()
                || source.chain().any(|cause| {
                    cause.downcast_ref::<DiskLabelCommitError>().is_some()
                        || cause
                            .downcast_ref::<StorageError>()
                            .is_some_and(StorageError::is_disklabel_commit)
                })
        })
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.kind)
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source.as_ref().map(|e| e.as_ref() as _)
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured StorageError.
    fn structured(self, kind: K) -> Result<T, StorageError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, StorageError> {
        match self {
            Some(t) => Ok(t),
            None => Err(StorageError(Box::new(StorageErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: None,
                context: Vec::new(),
            }))),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, StorageError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(StorageError(Box::new(StorageErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: Some(e.into()),
                context: Vec::new(),
            }))),
        }
    }
}

pub trait StorageResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, StorageError>;

    /// Convert the error into an unstructured error.
    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error>;
}
impl<T> StorageResultExt<T> for Result<T, StorageError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, StorageError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }

    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error> {
        self.map_err(|e| e.unstructured(context))
    }
}

impl Serialize for StorageError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("storage-error", 6)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::Device(ref e) => state.serialize_field("error", e)?,
            ErrorKind::DeviceTree(ref e) => state.serialize_field("error", e)?,
            ErrorKind::DiskLabelCommit(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Action(ref e) => state.serialize_field("error", e)?,
            ErrorKind::InvalidInput(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Internal(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        let context: Vec<&str> = self.0.context.iter().map(|(c, _)| c.as_ref()).collect();
        state.serialize_field("context", &context)?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{:?}", e)))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut index = 0;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use serde_yaml::Value;

    use super::*;

    #[test]
    fn test_error_serialize() {
        let e = StorageError(Box::new(StorageErrorInner {
            kind: ErrorKind::Device(DeviceError::NotLeaf {
                name: "sda".into(),
            }),
            location: Location::caller(),
            source: Some(
                std::fs::read("/non-existant-file")
                    .context("failed to read file")
                    .unwrap_err(),
            ),
            context: vec![("Failed to destroy disk".into(), Location::caller())],
        }));
        match serde_yaml::to_value(e).unwrap() {
            Value::Mapping(m) => {
                assert_eq!(m.len(), 6);
                assert_eq!(m["category"], Value::String("device".into()));
                assert_eq!(
                    m["error"]["not-leaf"]["name"],
                    Value::String("sda".into())
                );
                assert!(matches!(m["cause"], Value::String(_)));
                assert_eq!(
                    m["message"],
                    Value::String("Cannot destroy non-leaf device 'sda'".into())
                );
                assert_eq!(
                    m["context"],
                    Value::Sequence(vec![Value::String("Failed to destroy disk".into())])
                );
                match m["location"] {
                    Value::String(ref s) => assert!(s.contains("error.rs:")),
                    _ => panic!("location isn't string"),
                }
            }
            _ => panic!("value isn't mapping"),
        }
    }

    #[test]
    fn test_error_debug() {
        let error = Err::<(), _>(anyhow::anyhow!("z"))
            .context("x\ny")
            .structured(InternalError::Internal("w"))
            .unwrap_err();
        assert_eq!(
            format!("{:?}", error),
            format!(
                "Internal error: w at {}:{}\n\nCaused by:\n    0: x\n       y\n    1: z\n",
                error.0.location.file(),
                error.0.location.line(),
            ),
        );
    }

    #[test]
    fn test_disklabel_commit_detection() {
        let direct = StorageError::new(DiskLabelCommitError { disk: "sda".into() });
        assert!(direct.is_disklabel_commit());

        let wrapped = Err::<(), _>(anyhow::Error::new(DiskLabelCommitError {
            disk: "sda".into(),
        }))
        .context("Failed to add partition")
        .structured(DeviceError::Create {
            name: "sda1".into(),
        })
        .unwrap_err();
        assert!(wrapped.is_disklabel_commit());

        let nested = Err::<(), _>(wrapped)
            .structured(ActionError::Execute {
                action: "create-device".into(),
                device: "sda1".into(),
            })
            .unwrap_err();
        assert!(nested.is_disklabel_commit());

        let unrelated = Err::<(), _>(anyhow::anyhow!("exit status 5"))
            .structured(DeviceError::Create {
                name: "sda1".into(),
            })
            .unwrap_err();
        assert!(!unrelated.is_disklabel_commit());
    }
}
