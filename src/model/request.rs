use crate::model::{ModelAction, TransactionRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::Location;

/// Source location of the client call that produced a request. Captured when
/// the action is invoked, since the request may execute ticks later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl CallSite {
    #[track_caller]
    pub fn capture() -> Self {
        Location::caller().into()
    }
}

impl From<&'static Location<'static>> for CallSite {
    fn from(location: &'static Location<'static>) -> Self {
        Self {
            file: location.file(),
            line: location.line(),
            column: location.column(),
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// One logical database operation as the engine sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub model: String,
    pub action: ModelAction,
    pub args: serde_json::Value,
    /// Keys locating this request's result inside the response
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_path: Vec<String>,
    /// Display name, e.g. `user.findMany`
    pub client_method: String,
    #[serde(skip)]
    pub call_site: Option<CallSite>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionRef>,
}

impl Request {
    /// Key under which the engine nests this request's result, e.g. `findManyUser`
    pub fn root_name(&self) -> String {
        format!("{}{}", self.action.wire_action().as_str(), self.model)
    }
}
