//! Request descriptors
//!
//! A request is described by a fragment such as
//! `k1=v1&k2=v2&meta.env=grey&caller_namespace.caller_name`:
//! `key=value` components are caller metadata, `meta.`-prefixed keys are
//! destination metadata for the metadata router, and the single component
//! without `=` is the caller identity.

use std::{collections::HashMap, str::FromStr};

use lodestar_types::{Error, Result};

/// Prefix marking destination metadata in a fragment
pub const DST_META_PREFIX: &str = "meta.";

/// Caller identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub namespace: String,
    pub name: String,
}

/// Caller identity and metadata of one outgoing call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteRequest {
    pub caller: Option<Caller>,
    /// Matched against source bounds of routing rules
    pub metadata: HashMap<String, String>,
    /// Matched against endpoint metadata by the metadata router
    pub dst_metadata: HashMap<String, String>,
}

impl RouteRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_caller(mut self, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        self.caller = Some(Caller { namespace: namespace.into(), name: name.into() });
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_dst_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dst_metadata.insert(key.into(), value.into());
        self
    }

    /// Caller service name, empty when the caller is anonymous
    pub fn caller_name(&self) -> &str {
        self.caller.as_ref().map(|c| c.name.as_str()).unwrap_or_default()
    }

    pub fn caller_namespace(&self) -> &str {
        self.caller.as_ref().map(|c| c.namespace.as_str()).unwrap_or_default()
    }

    /// Parse a request fragment
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRequest` for an empty key or value, an
    /// incomplete caller identity, or more than one caller identity.
    pub fn parse(fragment: &str) -> Result<Self> {
        let mut request = Self::new();

        for component in fragment.split('&').filter(|c| !c.is_empty()) {
            if let Some((key, value)) = component.split_once('=') {
                if key.is_empty() || value.is_empty() {
                    return Err(Error::InvalidRequest(format!(
                        "Metadata '{}' needs both a key and a value",
                        component
                    )));
                }

                match key.strip_prefix(DST_META_PREFIX) {
                    Some("") => {
                        return Err(Error::InvalidRequest(format!(
                            "Destination metadata '{}' has an empty key",
                            component
                        )));
                    },
                    Some(dst_key) => {
                        request.dst_metadata.insert(dst_key.to_string(), value.to_string());
                    },
                    None => {
                        request.metadata.insert(key.to_string(), value.to_string());
                    },
                }
                continue;
            }

            let (namespace, name) = component.split_once('.').ok_or_else(|| {
                Error::InvalidRequest(format!("Caller '{}' must be namespace.name", component))
            })?;
            if namespace.is_empty() || name.is_empty() {
                return Err(Error::InvalidRequest(format!(
                    "Caller '{}' must be namespace.name",
                    component
                )));
            }
            if request.caller.is_some() {
                return Err(Error::InvalidRequest(format!(
                    "Fragment '{}' names more than one caller",
                    fragment
                )));
            }
            request.caller = Some(Caller { namespace: namespace.to_string(), name: name.to_string() });
        }

        Ok(request)
    }
}

impl FromStr for RouteRequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
