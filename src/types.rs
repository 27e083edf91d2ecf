//! Data structures used throughout the annotator.
//!
//! An [`AnnotationRecord`] is one VM-to-IP binding observed during a
//! discovery pass.  Records are keyed by IP in the annotation store and
//! flattened into rows by the publisher, one column per configured
//! [`AnnotationField`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Metadata observed for a single IP address.
///
/// A record is replaced wholesale whenever the IP is seen again; fields
/// from different observations are never merged.  `None` means the value
/// could not be read from the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationRecord {
    pub ip: String,
    pub name: Option<String>,
    pub host: Option<String>,
    pub datastore: Option<String>,
    pub port_group: Option<String>,
}

impl AnnotationRecord {
    /// Returns the value for `field`, if one was observed.
    pub fn field(&self, field: AnnotationField) -> Option<&str> {
        match field {
            AnnotationField::PortGroup => self.port_group.as_deref(),
            AnnotationField::Name => self.name.as_deref(),
            AnnotationField::Host => self.host.as_deref(),
            AnnotationField::Datastore => self.datastore.as_deref(),
        }
    }
}

/// An annotation column that can be published to the asset system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationField {
    PortGroup,
    Name,
    Host,
    Datastore,
}

impl AnnotationField {
    /// Column header used in the uploaded batch.
    pub fn label(self) -> &'static str {
        match self {
            AnnotationField::PortGroup => "VM Port Group",
            AnnotationField::Name => "VM Name",
            AnnotationField::Host => "VM Host Name",
            AnnotationField::Datastore => "VM Datastore",
        }
    }

    /// Default publish order.
    pub fn defaults() -> Vec<AnnotationField> {
        vec![
            AnnotationField::PortGroup,
            AnnotationField::Name,
            AnnotationField::Host,
            AnnotationField::Datastore,
        ]
    }
}

impl fmt::Display for AnnotationField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnnotationField::PortGroup => "port_group",
            AnnotationField::Name => "name",
            AnnotationField::Host => "host",
            AnnotationField::Datastore => "datastore",
        };
        f.write_str(name)
    }
}
